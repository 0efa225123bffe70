use super::DhtError;
use super::DhtResult;
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::time::Instant;

/// Nodes seen within this window count as good; older ones are stale.
pub const GOOD_NODE_TTL: Duration = Duration::from_secs(15 * 60);

/// A 160-bit Kademlia identifier, kept big-endian so byte-wise ordering is
/// numeric ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 20]);

/// XOR distance between two ids. Ordering compares the underlying 160-bit
/// value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; 20]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses an id from a 20-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> DhtResult<Self> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| DhtError::InvalidNodeRecord(bytes.len()))?;
        Ok(Self(arr))
    }

    /// A fresh random id. A DHT node id must be uniformly random, not
    /// derived from any torrent's info-hash.
    pub fn random() -> Self {
        let mut bytes = [0u8; 20];
        rand::rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Bit `index` counted from the most significant bit of the id.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Copy of this id with bit `index` (from the MSB) set.
    pub fn with_bit(mut self, index: usize) -> Self {
        self.0[index / 8] |= 0x80 >> (index % 8);
        self
    }

    /// Whether the leading `prefix_len` bits of `self` and `other` agree.
    pub fn shares_prefix(&self, other: &NodeId, prefix_len: usize) -> bool {
        let full_bytes = prefix_len / 8;
        if self.0[..full_bytes] != other.0[..full_bytes] {
            return false;
        }
        let rem = prefix_len % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem);
        self.0[full_bytes] & mask == other.0[full_bytes] & mask
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A remote DHT node: identity, UDP endpoint, and freshness.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    last_seen: Instant,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    /// Marks the node as just heard from.
    pub fn renew(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_good(&self) -> bool {
        self.last_seen.elapsed() < GOOD_NODE_TTL
    }

    pub fn distance_to(&self, target: &NodeId) -> Distance {
        self.id.distance(target)
    }

    /// Parses a concatenation of 26-byte compact node records
    /// (20-byte id, 4-byte IPv4, 2-byte big-endian port).
    pub fn decode_compact(blob: &[u8]) -> DhtResult<Vec<Node>> {
        if blob.len() % 26 != 0 {
            return Err(DhtError::InvalidNodeRecord(blob.len()));
        }
        blob.chunks_exact(26)
            .map(|record| {
                let id = NodeId::from_bytes(&record[..20])?;
                Ok(Node::new(id, decode_compact_addr(&record[20..26])?))
            })
            .collect()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Parses a 6-byte compact peer endpoint (4-byte IPv4, 2-byte port).
pub fn decode_compact_addr(record: &[u8]) -> DhtResult<SocketAddrV4> {
    if record.len() != 6 {
        return Err(DhtError::InvalidNodeRecord(record.len()));
    }
    let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
    let port = BigEndian::read_u16(&record[4..6]);
    Ok(SocketAddrV4::new(ip, port))
}

use super::node::{decode_compact_addr, Node, NodeId};
use super::DhtError;
use super::DhtResult;
use crate::bencode::{self, encoder::encode_to_vec, BencodeValue};
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Bootstrap `find_node` queries get a generous timeout.
pub const FIND_NODE_TIMEOUT: Duration = Duration::from_secs(5);
/// `get_peers` fans out much wider, so individual laggards are cut sooner.
pub const GET_PEERS_TIMEOUT: Duration = Duration::from_secs(2);

/// What a node answered to `get_peers`: either actual peer endpoints for the
/// info-hash, or the closer DHT nodes to continue the lookup through.
#[derive(Debug)]
pub enum GetPeersReply {
    Peers(Vec<SocketAddrV4>),
    Nodes(Vec<Node>),
}

/// KRPC endpoint: one UDP socket multiplexing every outstanding query.
///
/// Each outbound query is tagged with a 16-bit transaction id and parked in
/// a map from id to a oneshot slot; a background receive loop decodes
/// incoming datagrams and resolves the matching slot. Timed-out queries
/// remove their slot so the map cannot leak.
#[derive(Clone)]
pub struct Krpc {
    shared: Arc<Shared>,
}

struct Shared {
    socket: UdpSocket,
    local_id: NodeId,
    pending: Mutex<HashMap<u16, oneshot::Sender<BencodeValue>>>,
    next_tid: AtomicU16,
}

impl Krpc {
    /// Binds the UDP socket and spawns the receive loop.
    pub async fn bind(bind: SocketAddr, local_id: NodeId) -> DhtResult<Self> {
        let socket = UdpSocket::bind(bind).await?;
        let shared = Arc::new(Shared {
            socket,
            local_id,
            pending: Mutex::new(HashMap::new()),
            next_tid: AtomicU16::new(1),
        });
        tokio::spawn(recv_loop(Arc::clone(&shared)));
        Ok(Self { shared })
    }

    pub fn local_addr(&self) -> DhtResult<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// `find_node`: asks `addr` for the nodes it knows closest to `target`.
    pub async fn find_node(&self, addr: SocketAddrV4, target: &NodeId) -> DhtResult<Vec<Node>> {
        let args = vec![
            (
                b"id".to_vec(),
                BencodeValue::String(self.shared.local_id.as_bytes().to_vec()),
            ),
            (
                b"target".to_vec(),
                BencodeValue::String(target.as_bytes().to_vec()),
            ),
        ];
        let response = self
            .query(addr, "find_node", args, FIND_NODE_TIMEOUT)
            .await?;
        let body = response_body(&response)?;
        let nodes = body
            .get(b"nodes")
            .and_then(BencodeValue::as_bytes)
            .ok_or(DhtError::MalformedResponse("find_node without nodes"))?;
        Node::decode_compact(nodes)
    }

    /// `get_peers`: asks `addr` for peers of `info_hash`, or failing that
    /// for closer nodes.
    pub async fn get_peers(
        &self,
        addr: SocketAddrV4,
        info_hash: &[u8; 20],
    ) -> DhtResult<GetPeersReply> {
        let args = vec![
            (
                b"id".to_vec(),
                BencodeValue::String(self.shared.local_id.as_bytes().to_vec()),
            ),
            (
                b"info_hash".to_vec(),
                BencodeValue::String(info_hash.to_vec()),
            ),
        ];
        let response = self
            .query(addr, "get_peers", args, GET_PEERS_TIMEOUT)
            .await?;
        let body = response_body(&response)?;

        if let Some(values) = body.get(b"values").and_then(BencodeValue::as_list) {
            let mut peers = Vec::with_capacity(values.len());
            for value in values {
                match value.as_bytes().map(decode_compact_addr) {
                    Some(Ok(peer)) => peers.push(peer),
                    _ => trace!(from = %addr, "skipping malformed peer value"),
                }
            }
            return Ok(GetPeersReply::Peers(peers));
        }
        if let Some(nodes) = body.get(b"nodes").and_then(BencodeValue::as_bytes) {
            return Ok(GetPeersReply::Nodes(Node::decode_compact(nodes)?));
        }
        Err(DhtError::MalformedResponse(
            "get_peers without values or nodes",
        ))
    }

    async fn query(
        &self,
        addr: SocketAddrV4,
        name: &'static str,
        args: Vec<(Vec<u8>, BencodeValue)>,
        wait: Duration,
    ) -> DhtResult<BencodeValue> {
        let tid = self.shared.next_tid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(tid, tx);

        let datagram = encode_to_vec(&query_message(tid, name, args));
        trace!(%addr, query = name, tid, "sending KRPC query");
        if let Err(e) = self.shared.socket.send_to(&datagram, addr).await {
            self.shared.pending.lock().await.remove(&tid);
            return Err(e.into());
        }

        match timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DhtError::TransportClosed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&tid);
                Err(DhtError::Timeout(name, addr))
            }
        }
    }
}

/// Builds the bencoded query dictionary. Keys are inserted pre-sorted
/// (`a`, `q`, `t`, `y`) since the encoder writes insertion order.
fn query_message(tid: u16, name: &str, args: Vec<(Vec<u8>, BencodeValue)>) -> BencodeValue {
    BencodeValue::Dict(vec![
        (b"a".to_vec(), BencodeValue::Dict(args)),
        (b"q".to_vec(), BencodeValue::String(name.as_bytes().to_vec())),
        (
            b"t".to_vec(),
            BencodeValue::String(tid.to_be_bytes().to_vec()),
        ),
        (b"y".to_vec(), BencodeValue::String(b"q".to_vec())),
    ])
}

fn response_body(response: &BencodeValue) -> DhtResult<&BencodeValue> {
    response
        .get(b"r")
        .ok_or(DhtError::MalformedResponse("missing response body"))
}

/// Drains the socket, matching datagrams to parked queries by transaction
/// id. Unmatched or unparseable datagrams are logged and dropped.
async fn recv_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        let (len, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("KRPC socket receive error: {e}");
                continue;
            }
        };
        let message = match bencode::decode(&buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from, "dropping undecodable datagram: {e}");
                continue;
            }
        };
        let Some(tid_bytes) = message.get(b"t").and_then(BencodeValue::as_bytes) else {
            warn!(%from, "datagram without transaction id");
            continue;
        };
        let Ok(tid_bytes) = <[u8; 2]>::try_from(tid_bytes) else {
            warn!(%from, "transaction id is not 2 bytes");
            continue;
        };
        let tid = u16::from_be_bytes(tid_bytes);

        let Some(slot) = shared.pending.lock().await.remove(&tid) else {
            warn!(%from, tid, "no query outstanding for transaction id");
            continue;
        };
        if slot.send(message).is_err() {
            trace!(tid, "query abandoned before response arrived");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => panic!("expected IPv4"),
        }
    }

    #[test]
    fn query_message_matches_krpc_wire_format() {
        let local = NodeId::new([b'a'; 20]);
        let args = vec![
            (
                b"id".to_vec(),
                BencodeValue::String(local.as_bytes().to_vec()),
            ),
            (
                b"target".to_vec(),
                BencodeValue::String(local.as_bytes().to_vec()),
            ),
        ];
        let wire = encode_to_vec(&query_message(0x0102, "find_node", args));
        let expected = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaa6:target20:aaaaaaaaaaaaaaaaaaaae1:q9:find_node1:t2:\x01\x021:y1:qe";
        assert_eq!(wire, expected);
    }

    /// A scripted remote node: answers one find_node with a fixed compact
    /// node blob.
    async fn scripted_responder(reply_nodes: Vec<u8>) -> SocketAddrV4 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(socket.local_addr().unwrap());
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let query = bencode::decode(&buf[..len]).unwrap();
            let tid = query.get(b"t").unwrap().as_bytes().unwrap().to_vec();
            let response = BencodeValue::Dict(vec![
                (
                    b"r".to_vec(),
                    BencodeValue::Dict(vec![
                        (b"id".to_vec(), BencodeValue::String(vec![9u8; 20])),
                        (b"nodes".to_vec(), BencodeValue::String(reply_nodes)),
                    ]),
                ),
                (b"t".to_vec(), BencodeValue::String(tid)),
                (b"y".to_vec(), BencodeValue::String(b"r".to_vec())),
            ]);
            socket
                .send_to(&encode_to_vec(&response), from)
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn find_node_round_trip_over_loopback() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&[0x42; 20]);
        blob.extend_from_slice(&[10, 1, 2, 3, 0x1a, 0xe1]);
        let responder = scripted_responder(blob).await;

        let krpc = Krpc::bind("127.0.0.1:0".parse().unwrap(), NodeId::random())
            .await
            .unwrap();
        let nodes = krpc.find_node(responder, &NodeId::random()).await.unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, NodeId::new([0x42; 20]));
        assert_eq!(
            nodes[0].addr,
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6881)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_query_times_out_and_clears_its_slot() {
        // Nothing listens here; auto-advanced time trips the timeout
        // immediately.
        let krpc = Krpc::bind("127.0.0.1:0".parse().unwrap(), NodeId::random())
            .await
            .unwrap();
        let silent: SocketAddrV4 = "127.0.0.1:9".parse().unwrap();

        let result = krpc.find_node(silent, &NodeId::random()).await;
        assert!(matches!(result, Err(DhtError::Timeout("find_node", _))));
        assert!(krpc.shared.pending.lock().await.is_empty());
    }
}

//! Kademlia DHT peer discovery (BEP-5).
//!
//! The DHT stack has four layers: [`node`] holds the 160-bit id space and
//! compact wire records, [`bucket`]/[`routing`] implement the Kademlia
//! routing table, [`krpc`] is the UDP request/response plexer, and
//! [`server`] drives the iterative bootstrap and `get_peers` lookups.
use std::net::SocketAddrV4;
use thiserror::Error;

pub mod bucket;
pub mod krpc;
pub mod node;
pub mod routing;
pub mod server;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("{0} query to {1} timed out")]
    Timeout(&'static str, SocketAddrV4),

    #[error("malformed KRPC response: {0}")]
    MalformedResponse(&'static str),

    #[error("compact node blob has invalid length {0}")]
    InvalidNodeRecord(usize),

    #[error("KRPC transport closed")]
    TransportClosed,
}

pub type DhtResult<T> = std::result::Result<T, DhtError>;

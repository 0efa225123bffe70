//! Peer-wire protocol: handshake, message framing, and the per-peer
//! session state machine.
use std::net::SocketAddrV4;
use thiserror::Error;

pub mod handshake;
pub mod message;
pub mod session;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddrV4),

    #[error("handshake failed: invalid protocol identifier")]
    InvalidProtocol,

    #[error("handshake failed: info hash mismatch")]
    InfoHashMismatch,

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("malformed {0} message")]
    MalformedMessage(&'static str),

    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u32),

    #[error("timed out waiting for block {index}:{begin}")]
    BlockTimeout { index: u32, begin: u32 },

    #[error("piece {0} checksum mismatch")]
    ChecksumMismatch(u32),

    #[error("session stopped")]
    SessionStopped,
}

impl PeerError {
    /// True for failures that mean the connection itself is gone. The
    /// coordinator evicts the peer on these and merely re-enqueues the piece
    /// on everything else.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, PeerError::Io(_) | PeerError::SessionStopped)
    }
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

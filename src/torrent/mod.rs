//! Torrent metainfo parsing and piece bookkeeping.
//!
//! This module owns the `.torrent` file model: decoding, info-hash
//! computation, and the piece/block partition the download engine works in.
use thiserror::Error;
pub mod file;
pub mod info_hash;
pub mod piece;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("pieces hash length is not a multiple of 20")]
    InvalidPiecesHashLength,
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;

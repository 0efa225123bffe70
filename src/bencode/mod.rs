use thiserror::Error;
pub mod decoder;
pub mod encoder;

pub use decoder::decode;
pub use encoder::encode;

/// A bencoded value as used by torrent metainfo files and KRPC messages.
///
/// Bencode has exactly four kinds:
///
/// 1. `String(Vec<u8>)`: a length-prefixed byte string (`4:spam`). Stored
///    as raw bytes since torrent fields like `pieces` are not UTF-8.
/// 2. `Integer(i64)`: `i42e`.
/// 3. `List(Vec<BencodeValue>)`: `l...e`.
/// 4. `Dict(...)`: `d...e`, byte-string keys mapping to values. Entries are
///    kept as a `Vec` of pairs in wire order so that re-encoding a decoded
///    dictionary reproduces the input bytes exactly; the info-hash depends
///    on this.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

impl BencodeValue {
    /// Looks up a dictionary entry by key. Returns `None` for missing keys
    /// and for non-dictionary values.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        match self {
            BencodeValue::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_slice() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Custom error type for bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("invalid token {0:#04x} at byte {1}")]
    InvalidToken(u8, usize),

    #[error("declared length {declared} overruns input ({remaining} bytes remain)")]
    LengthMismatch { declared: usize, remaining: usize },

    #[error("invalid integer literal")]
    InvalidInteger,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

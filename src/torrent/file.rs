//! Torrent file structure and parsing logic.
//!
//! Defines [`TorrentFile`], the immutable metainfo model every other layer
//! works against: identity (info-hash), file enumeration, and the piece
//! partition.
use super::info_hash;
use super::piece::Piece;
use super::TorrentError;
use super::TorrentResult;
use crate::bencode::{self, BencodeValue};
use std::fmt;
use std::path::Path;

/// Parsed `.torrent` metainfo. Immutable after load.
#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub name: String,
    pub piece_length: u32,
    /// Files carried by the torrent. Single-file torrents are represented as
    /// one entry named after the torrent itself, so `total_size` is always
    /// the sum over this list.
    pub files: Vec<FileEntry>,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub path: String,
    pub length: u64,
}

impl TorrentFile {
    /// Reads and parses a `.torrent` file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> TorrentResult<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parses metainfo from its bencoded byte form.
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn from_bytes(data: &[u8]) -> TorrentResult<Self> {
        let root = bencode::decode(data)?;

        let announce = utf8_field(&root, b"announce")?;

        let info = root
            .get(b"info")
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let name = utf8_field(info, b"name")?;

        let piece_length = match info.get(b"piece length").and_then(BencodeValue::as_int) {
            Some(n) if n > 0 => n as u32,
            Some(n) => {
                return Err(TorrentError::InvalidFormat(format!(
                    "piece length must be positive, got {n}"
                )))
            }
            None => return Err(TorrentError::MissingField("piece length".to_string())),
        };

        let pieces_bytes = info
            .get(b"pieces")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?;
        let pieces_hash = parse_pieces(pieces_bytes)?;

        let files = parse_files(info, &name)?;

        // The info-hash is taken over the raw `info` span as it appeared on
        // the wire, never over a re-encoding.
        let info_hash = info_hash::compute(data)?;

        let torrent = Self {
            announce,
            name,
            piece_length,
            files,
            info_hash,
            pieces_hash,
        };

        let expected_pieces = torrent.total_size().div_ceil(piece_length as u64);
        if expected_pieces != torrent.pieces_hash.len() as u64 {
            return Err(TorrentError::InvalidFormat(format!(
                "{} piece hashes for {} bytes of payload",
                torrent.pieces_hash.len(),
                torrent.total_size()
            )));
        }

        Ok(torrent)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    /// Length of piece `index`: `piece_length` for all but the last piece,
    /// which carries the remainder.
    pub fn piece_size(&self, index: usize) -> u32 {
        if index + 1 == self.num_pieces() {
            let full = (self.num_pieces() as u64 - 1) * self.piece_length as u64;
            (self.total_size() - full) as u32
        } else {
            self.piece_length
        }
    }

    /// Enumerates every piece with its file offset, length, checksum, and
    /// block partition.
    pub fn pieces(&self) -> Vec<Piece> {
        self.pieces_hash
            .iter()
            .enumerate()
            .map(|(index, checksum)| {
                Piece::new(
                    index as u32,
                    index as u64 * self.piece_length as u64,
                    self.piece_size(index),
                    *checksum,
                )
            })
            .collect()
    }
}

impl fmt::Display for TorrentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "total length: {}", self.total_size())?;
        writeln!(f, "announce url: {}", self.announce)?;
        write!(f, "info hash: {}", hex::encode(self.info_hash))
    }
}

fn utf8_field(dict: &BencodeValue, key: &[u8]) -> TorrentResult<String> {
    let bytes = dict
        .get(key)
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::MissingField(String::from_utf8_lossy(key).into_owned()))?;
    String::from_utf8(bytes.to_vec()).map_err(|e| {
        TorrentError::InvalidFormat(format!(
            "{} is not UTF-8: {e}",
            String::from_utf8_lossy(key)
        ))
    })
}

/// Splits the concatenated 20-byte SHA-1 digests from the `pieces` string.
/// Digest order corresponds directly to piece index.
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Builds the file list. Multi-file torrents enumerate `files` entries with
/// their path components joined by `/`; single-file torrents become one entry
/// named after the torrent.
fn parse_files(info: &BencodeValue, name: &str) -> TorrentResult<Vec<FileEntry>> {
    let Some(file_list) = info.get(b"files").and_then(BencodeValue::as_list) else {
        let length = info
            .get(b"length")
            .and_then(BencodeValue::as_int)
            .ok_or_else(|| TorrentError::MissingField("length".to_string()))?;
        return Ok(vec![FileEntry {
            path: name.to_string(),
            length: length as u64,
        }]);
    };

    let mut files = Vec::with_capacity(file_list.len());
    for entry in file_list {
        let length = entry
            .get(b"length")
            .and_then(BencodeValue::as_int)
            .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?;

        let components = entry
            .get(b"path")
            .and_then(BencodeValue::as_list)
            .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
        let mut parts = Vec::with_capacity(components.len());
        for component in components {
            let bytes = component.as_bytes().ok_or_else(|| {
                TorrentError::InvalidFormat("file path component not a string".to_string())
            })?;
            parts.push(String::from_utf8(bytes.to_vec()).map_err(|e| {
                TorrentError::InvalidFormat(format!("file path is not UTF-8: {e}"))
            })?);
        }

        files.push(FileEntry {
            path: parts.join("/"),
            length: length as u64,
        });
    }
    Ok(files)
}

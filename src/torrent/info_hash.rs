use super::TorrentError;
use super::TorrentResult;
use crate::bencode::decoder::raw_dict_value;
use sha1::Digest;
use sha1::Sha1;

/// Computes the SHA-1 info-hash of a bencoded metainfo document.
///
/// The digest is taken over the raw byte span of the `info` sub-value
/// exactly as it appeared in `metainfo`. Decoding and re-encoding would tie
/// the hash to parser representation details (key ordering, integer
/// formatting); the wire span is authoritative.
pub fn compute(metainfo: &[u8]) -> TorrentResult<[u8; 20]> {
    let info_span = raw_dict_value(metainfo, b"info")?
        .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;

    let mut hasher = Sha1::new();
    hasher.update(info_span);

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&hasher.finalize());
    Ok(info_hash)
}

//! Tracker client logic for the BitTorrent protocol.
//!
//! The HTTP tracker is a fallback peer source: the client asks it for
//! peers only when the DHT comes up empty. Announce requests carry the
//! torrent identity and transfer totals; the bencoded response holds a
//! re-announce interval and a peer list in compact or dictionary form.
use crate::torrent::file::TorrentFile;
use anyhow::{bail, Result};
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::debug;

/// A client announcing to an HTTP tracker.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

/// Parsed announce response.
#[derive(Debug)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants us to wait before re-announcing.
    pub interval: i64,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(serde_bytes::ByteBuf::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

impl Client {
    pub fn new(peer_id: [u8; 20], port: u16) -> Self {
        Self { peer_id, port }
    }

    /// Sends an announce request and returns the tracker's peer list.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(
        &self,
        torrent: &TorrentFile,
        downloaded: u64,
    ) -> Result<AnnounceResponse> {
        let left = torrent.total_size().saturating_sub(downloaded);
        // The info-hash and peer id are raw bytes. Each value is escaped
        // up front and the finished query installed wholesale; pushing the
        // pre-escaped strings through the query-pair API would escape the
        // escapes.
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded={}&left={}&compact=1",
            url_encode(&torrent.info_hash),
            url_encode(&self.peer_id),
            self.port,
            downloaded,
            left,
        );
        let mut url = url::Url::parse(&torrent.announce)?;
        url.set_query(Some(&query));

        debug!(%url, "announcing to tracker");
        let response = reqwest::get(url).await?;
        let bytes = response.bytes().await?;
        parse_announce_response(&bytes)
    }
}

/// Parses a bencoded announce response, handling both peer list forms:
/// compact (6 bytes per peer: IPv4 + big-endian port) and the legacy list
/// of `{ip, port}` dictionaries. A `failure reason` key means the tracker
/// rejected the announce.
fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse> {
    let response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = response.failure_reason {
        bail!("tracker refused announce: {reason}");
    }

    let peers = match response.peers {
        Peers::Compact(blob) => blob
            .chunks_exact(6)
            .map(|chunk| {
                SocketAddrV4::new(
                    Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                    BigEndian::read_u16(&chunk[4..6]),
                )
            })
            .collect(),
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip
                    .parse::<Ipv4Addr>()
                    .ok()
                    .map(|ip| SocketAddrV4::new(ip, dict.port))
            })
            .collect(),
    };

    Ok(AnnounceResponse {
        interval: response.interval,
        peers,
    })
}

/// Generates this client's peer id: an 8-byte client tag followed by 12
/// random decimal digits.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-RD0001-");
    let mut rng = rand::rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.random_range(b'0'..=b'9');
    }
    peer_id
}

/// Escapes arbitrary bytes for a query-string value. Trackers parse the
/// announce query as form-urlencoded, so the `url` crate's serializer does
/// the right thing for raw hash bytes.
fn url_encode(bytes: &[u8]) -> String {
    url::form_urlencoded::byte_serialize(bytes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        // interval 1800, two compact peers.
        let body = b"d8:intervali1800e5:peers12:\x0a\x00\x00\x01\x1a\xe1\xc0\xa8\x01\x02\x00\x50e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(
            response.peers,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881),
                SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 80),
            ]
        );
    }

    #[test]
    fn parses_dictionary_peer_list() {
        let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.94:porti6881eeee";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(
            response.peers,
            vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 6881)]
        );
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = b"d14:failure reason15:torrent unknowne";
        let err = parse_announce_response(body).unwrap_err();
        assert!(err.to_string().contains("torrent unknown"));
    }

    #[test]
    fn peer_id_has_tag_and_digits() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-RD0001-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn url_encodes_raw_hash_bytes() {
        assert_eq!(url_encode(b"Az09"), "Az09");
        assert_eq!(url_encode(&[0x00, 0xff]), "%00%FF");
    }
}

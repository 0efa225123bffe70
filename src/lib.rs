//! Library root for rs-dht-torrent.
//!
//! A BitTorrent download engine with DHT peer discovery: bencode codec,
//! metainfo model, Kademlia DHT, peer-wire sessions, the download
//! coordinator, and an HTTP tracker fallback.
pub mod bencode;
pub mod client;
pub mod dht;
pub mod peer;
pub mod torrent;
pub mod tracker;

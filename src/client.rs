//! The download coordinator.
//!
//! Wires the whole engine together: a discovery task keeps a pool of
//! connected peer sessions topped up from the DHT (with an optional tracker
//! fallback), a fixed fan-out of workers pulls pieces off a bounded queue
//! and downloads them from randomly chosen eligible peers, and a single
//! writer task places verified pieces at their file offsets. The two
//! bounded queues between generator, workers, and writer provide the
//! backpressure; the writer shuts both down when the last piece lands.
use crate::dht::node::NodeId;
use crate::dht::server::DhtServer;
use crate::peer::session::PeerSession;
use crate::torrent::file::TorrentFile;
use crate::torrent::piece::Piece;
use crate::tracker;
use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use std::io::SeekFrom;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Capacity of the piece download queue; small so the generator trickles
/// pieces out as workers free up.
const DOWNLOAD_QUEUE_CAPACITY: usize = 5;
const SAVER_QUEUE_CAPACITY: usize = 1;
/// Pause between pool checks when saturated and between peer scans when no
/// peer is eligible.
const PEER_WAIT: Duration = Duration::from_secs(10);
/// Consecutive empty discovery rounds tolerated before giving up, provided
/// no peer was ever connected.
const MAX_BARREN_ROUNDS: usize = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// UDP port the DHT node binds.
    pub dht_port: u16,
    /// Discovery stops topping up the pool at this many live peers.
    pub peer_pool_target: usize,
    /// Concurrent piece download workers.
    pub worker_count: usize,
    /// Node budget per DHT bootstrap round.
    pub bootstrap_max_nodes: usize,
    /// Directory the output file is created in.
    pub output_dir: PathBuf,
    /// Fall back to the HTTP tracker when the DHT yields no peers.
    pub use_tracker: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dht_port: 9999,
            peer_pool_target: 15,
            worker_count: 150,
            bootstrap_max_nodes: 100,
            output_dir: PathBuf::from("."),
            use_tracker: false,
        }
    }
}

/// A verified piece on its way to disk.
struct DownloadedPiece {
    index: u32,
    offset_in_file: u64,
    data: Vec<u8>,
}

/// The piece queue is MPMC by construction: one receiver shared behind a
/// mutex, drained by every worker.
type PieceRx = Arc<Mutex<mpsc::Receiver<Piece>>>;

pub struct TorrentClient {
    torrent: TorrentFile,
    config: ClientConfig,
    peer_id: [u8; 20],
    valid_peers: Mutex<Vec<Arc<PeerSession>>>,
}

impl TorrentClient {
    pub fn new(torrent: TorrentFile, config: ClientConfig) -> Self {
        Self {
            torrent,
            config,
            peer_id: tracker::generate_peer_id(),
            valid_peers: Mutex::new(Vec::new()),
        }
    }

    /// Runs the download to completion. Returns once every piece has been
    /// verified and written, or fails fast on a fatal condition (DHT socket
    /// unavailable, output file not writable, no peers discoverable).
    pub async fn run(self) -> Result<()> {
        let client = Arc::new(self);
        let pieces = client.torrent.pieces();
        let total_pieces = pieces.len();
        info!(
            torrent = %client.torrent.name,
            total_pieces,
            size = client.torrent.total_size(),
            "starting download"
        );

        let (piece_tx, piece_rx) = mpsc::channel::<Piece>(DOWNLOAD_QUEUE_CAPACITY);
        let piece_rx: PieceRx = Arc::new(Mutex::new(piece_rx));
        let (saver_tx, saver_rx) = mpsc::channel::<DownloadedPiece>(SAVER_QUEUE_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);

        let mut discovery = tokio::spawn(Arc::clone(&client).collect_peers());

        // Every piece enters the bounded queue exactly once; only failed
        // downloads put it back.
        let generator_tx = piece_tx.clone();
        tokio::spawn(async move {
            for piece in pieces {
                if generator_tx.send(piece).await.is_err() {
                    return;
                }
            }
            debug!("all pieces enqueued");
        });

        let mut workers = JoinSet::new();
        for worker in 0..client.config.worker_count {
            workers.spawn(Arc::clone(&client).download_worker(
                worker,
                Arc::clone(&piece_rx),
                piece_tx.clone(),
                saver_tx.clone(),
                done_rx.clone(),
            ));
        }
        drop(piece_tx);
        drop(saver_tx);

        let saved = tokio::select! {
            saved = Arc::clone(&client).file_saver(saver_rx, done_tx, total_pieces) => saved,
            joined = &mut discovery => match joined {
                Ok(fatal) => fatal,
                Err(e) => Err(e).context("peer discovery task failed"),
            },
        };
        discovery.abort();
        workers.shutdown().await;
        saved?;

        info!(torrent = %client.torrent.name, "download complete");
        Ok(())
    }

    /// One download worker: dequeue a piece, pick a peer, fetch, hand the
    /// verified bytes to the writer. Failed pieces go back on the queue;
    /// disconnected peers leave the pool.
    async fn download_worker(
        self: Arc<Self>,
        worker: usize,
        piece_rx: PieceRx,
        retry_tx: mpsc::Sender<Piece>,
        saver_tx: mpsc::Sender<DownloadedPiece>,
        mut done_rx: watch::Receiver<bool>,
    ) {
        loop {
            let piece = tokio::select! {
                received = next_piece(&piece_rx) => match received {
                    Some(piece) => piece,
                    None => {
                        debug!(worker, "piece queue closed, exiting");
                        return;
                    }
                },
                _ = done_rx.changed() => {
                    debug!(worker, "piece queue shut down, exiting");
                    return;
                }
            };

            let peer = self.choose_peer(piece.index).await;
            match peer.download_piece(&piece).await {
                Ok(data) => {
                    let saved = DownloadedPiece {
                        index: piece.index,
                        offset_in_file: piece.offset_in_file,
                        data,
                    };
                    if saver_tx.send(saved).await.is_err() {
                        debug!(worker, "saver queue closed, exiting");
                        return;
                    }
                }
                Err(e) if e.is_disconnect() => {
                    warn!(peer = %peer.addr(), piece = piece.index, "peer disconnected: {e}");
                    self.evict_peer(&peer).await;
                    if retry_tx.send(piece).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer.addr(), piece = piece.index, "download failed, re-enqueueing: {e}");
                    if retry_tx.send(piece).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn evict_peer(&self, peer: &Arc<PeerSession>) {
        self.valid_peers
            .lock()
            .await
            .retain(|p| !Arc::ptr_eq(p, peer));
    }

    /// Picks a peer that is unchoked and owns `piece_index`, retrying every
    /// [`PEER_WAIT`] until one appears. The pool is shuffled on every scan
    /// so load spreads across peers instead of converging on the first fast
    /// one.
    async fn choose_peer(&self, piece_index: u32) -> Arc<PeerSession> {
        loop {
            {
                let mut peers = self.valid_peers.lock().await;
                peers.shuffle(&mut rand::rng());
                for peer in peers.iter() {
                    if peer.can_download() && peer.has_piece(piece_index).await {
                        return Arc::clone(peer);
                    }
                }
            }
            debug!(piece_index, "no peer can serve this piece, waiting");
            tokio::time::sleep(PEER_WAIT).await;
        }
    }

    /// Peer discovery: DHT bootstrap plus `get_peers` rounds until the pool
    /// reaches its target, then idles and tops up as peers drop out.
    /// Returns an error only on fatal conditions; the caller treats that as
    /// the end of the download.
    async fn collect_peers(self: Arc<Self>) -> Result<()> {
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.dht_port));
        let mut dht = DhtServer::bind(bind, NodeId::random())
            .await
            .context("binding DHT socket")?;
        let tracker_client = self
            .config
            .use_tracker
            .then(|| tracker::Client::new(self.peer_id, self.config.dht_port));

        let mut barren_rounds = 0;
        loop {
            {
                let mut peers = self.valid_peers.lock().await;
                peers.retain(|p| p.is_running());
                if peers.len() >= self.config.peer_pool_target {
                    debug!(pool = peers.len(), "peer pool saturated, skipping DHT round");
                    drop(peers);
                    tokio::time::sleep(PEER_WAIT).await;
                    continue;
                }
            }

            dht.bootstrap(self.config.bootstrap_max_nodes).await;
            let mut endpoints: Vec<SocketAddrV4> = dht
                .get_peers(&self.torrent.info_hash)
                .await
                .into_iter()
                .collect();

            if endpoints.is_empty() {
                if let Some(tracker_client) = &tracker_client {
                    match tracker_client.announce(&self.torrent, 0).await {
                        Ok(response) => {
                            info!(peers = response.peers.len(), "tracker fallback answered");
                            endpoints.extend(response.peers);
                        }
                        Err(e) => warn!("tracker fallback failed: {e}"),
                    }
                }
            }
            info!(endpoints = endpoints.len(), "discovery round finished");

            if endpoints.is_empty() {
                barren_rounds += 1;
                if barren_rounds >= MAX_BARREN_ROUNDS && self.valid_peers.lock().await.is_empty() {
                    bail!("no peers discoverable after {MAX_BARREN_ROUNDS} DHT rounds");
                }
                continue;
            }
            barren_rounds = 0;

            for addr in endpoints {
                {
                    let peers = self.valid_peers.lock().await;
                    if peers.len() >= self.config.peer_pool_target {
                        break;
                    }
                    if peers.iter().any(|p| p.addr() == addr) {
                        continue;
                    }
                }
                match PeerSession::connect(
                    addr,
                    self.torrent.info_hash,
                    self.peer_id,
                    self.torrent.num_pieces() as u32,
                )
                .await
                {
                    Ok(session) => self.valid_peers.lock().await.push(session),
                    Err(e) => debug!(peer = %addr, "skipping peer: {e}"),
                }
            }
        }
    }

    /// Sole writer of the output file. Pieces arrive in arbitrary order and
    /// are placed by seeking to `index * piece_length`. When the counter
    /// reaches the total the queues shut down, which is what terminates the
    /// workers.
    async fn file_saver(
        self: Arc<Self>,
        mut saver_rx: mpsc::Receiver<DownloadedPiece>,
        done_tx: watch::Sender<bool>,
        total_pieces: usize,
    ) -> Result<()> {
        let path = self.config.output_dir.join(&self.torrent.name);
        let mut file = File::create(&path)
            .await
            .with_context(|| format!("creating output file {}", path.display()))?;
        file.set_len(self.torrent.total_size()).await?;

        let mut downloaded = 0usize;
        while let Some(piece) = saver_rx.recv().await {
            file.seek(SeekFrom::Start(piece.offset_in_file)).await?;
            file.write_all(&piece.data).await?;
            file.flush().await?;
            downloaded += 1;
            info!(
                piece = piece.index,
                downloaded, total_pieces,
                "piece saved"
            );

            if downloaded == total_pieces {
                saver_rx.close();
                let _ = done_tx.send(true);
                break;
            }
        }

        file.sync_all().await?;
        Ok(())
    }
}

async fn next_piece(piece_rx: &PieceRx) -> Option<Piece> {
    piece_rx.lock().await.recv().await
}

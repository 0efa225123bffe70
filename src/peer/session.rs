use super::handshake::Handshake;
use super::message::{bitfield_indices, Message};
use super::PeerError;
use super::PeerResult;
use crate::torrent::piece::Piece;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// A block request parked until the matching `Piece` frame arrives.
/// Keyed by `(piece index, begin offset)`; responses are demultiplexed by
/// key, never by arrival order.
type PendingBlocks = HashMap<(u32, u32), oneshot::Sender<Vec<u8>>>;

/// One connected remote peer.
///
/// After `connect` the session owns the TCP stream split in two: a spawned
/// read loop drives the inbound state machine (choke flag, remote piece
/// set, block demux) and a heartbeat task keeps the connection alive, while
/// download workers call [`download_piece`](Self::download_piece) through
/// the shared handle.
#[derive(Debug)]
pub struct PeerSession {
    addr: SocketAddrV4,
    num_pieces: u32,
    running: AtomicBool,
    choked: AtomicBool,
    remote_pieces: Mutex<HashSet<u32>>,
    pending: Mutex<PendingBlocks>,
    writer: Mutex<OwnedWriteHalf>,
}

impl PeerSession {
    /// Opens a connection, exchanges handshakes, and declares interest.
    /// The returned session is running and choked until the peer unchokes
    /// us.
    pub async fn connect(
        addr: SocketAddrV4,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        num_pieces: u32,
    ) -> PeerResult<Arc<Self>> {
        debug!(%addr, "opening peer connection");
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout(addr))??;

        stream
            .write_all(&Handshake::new(info_hash, peer_id).serialize())
            .await?;
        let theirs = Handshake::read(&mut stream).await?;
        theirs.validate(&info_hash)?;
        stream.write_all(&Message::Interested.serialize()).await?;

        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Self {
            addr,
            num_pieces,
            running: AtomicBool::new(true),
            choked: AtomicBool::new(true),
            remote_pieces: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(write_half),
        });
        tokio::spawn(Arc::clone(&session).read_loop(read_half));
        tokio::spawn(Arc::clone(&session).heartbeat());
        info!(%addr, "peer session established");
        Ok(session)
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// A peer can serve blocks only while the session runs and the peer has
    /// unchoked us.
    pub fn can_download(&self) -> bool {
        self.is_running() && !self.choked.load(Ordering::Acquire)
    }

    pub async fn has_piece(&self, index: u32) -> bool {
        self.remote_pieces.lock().await.contains(&index)
    }

    /// Fetches and verifies one piece: every block in order, each awaited
    /// up to [`BLOCK_TIMEOUT`], then the SHA-1 gate. A verified piece is
    /// announced back to the peer with `Have`.
    pub async fn download_piece(&self, piece: &Piece) -> PeerResult<Vec<u8>> {
        let mut data = Vec::with_capacity(piece.length as usize);
        for block in &piece.blocks {
            let bytes = self
                .request_block(piece.index, block.offset, block.length)
                .await?;
            if bytes.len() != block.length as usize {
                return Err(PeerError::MalformedMessage("piece"));
            }
            data.extend_from_slice(&bytes);
        }

        let mut hasher = Sha1::new();
        hasher.update(&data);
        if hasher.finalize()[..] != piece.checksum {
            return Err(PeerError::ChecksumMismatch(piece.index));
        }

        self.send(&Message::Have(piece.index)).await?;
        debug!(peer = %self.addr, piece = piece.index, "piece downloaded and verified");
        Ok(data)
    }

    /// Issues one `Request` and parks until the matching block arrives.
    /// The pending slot is registered before the request goes out so a fast
    /// response cannot slip past the demux, and removed again on timeout.
    async fn request_block(&self, index: u32, begin: u32, length: u32) -> PeerResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert((index, begin), tx);

        let request = Message::Request {
            index,
            begin,
            length,
        };
        if let Err(e) = self.send(&request).await {
            self.pending.lock().await.remove(&(index, begin));
            return Err(e);
        }
        trace!(peer = %self.addr, index, begin, length, "block requested");

        match timeout(BLOCK_TIMEOUT, rx).await {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(_)) => Err(PeerError::SessionStopped),
            Err(_) => {
                self.pending.lock().await.remove(&(index, begin));
                Err(PeerError::BlockTimeout { index, begin })
            }
        }
    }

    async fn send(&self, message: &Message) -> PeerResult<()> {
        if !self.is_running() {
            return Err(PeerError::SessionStopped);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&message.serialize()).await?;
        Ok(())
    }

    /// Inbound state machine. Any framing error, including an unknown
    /// message id, stops the session.
    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        while self.is_running() {
            let message = match Message::read(&mut reader).await {
                Ok(m) => m,
                Err(e) => {
                    debug!(peer = %self.addr, "read loop stopping: {e}");
                    break;
                }
            };
            match message {
                Message::Unchoke => self.choked.store(false, Ordering::Release),
                Message::Choke => self.choked.store(true, Ordering::Release),
                Message::Have(index) => {
                    if index < self.num_pieces {
                        self.remote_pieces.lock().await.insert(index);
                    }
                }
                Message::Bitfield(bits) => {
                    let indices = bitfield_indices(&bits, self.num_pieces);
                    trace!(peer = %self.addr, pieces = indices.len(), "bitfield received");
                    self.remote_pieces.lock().await.extend(indices);
                }
                Message::Piece {
                    index,
                    begin,
                    block,
                } => {
                    let slot = self.pending.lock().await.remove(&(index, begin));
                    match slot {
                        Some(tx) => {
                            let _ = tx.send(block);
                        }
                        None => {
                            warn!(peer = %self.addr, index, begin, "unsolicited block, dropping")
                        }
                    }
                }
                // We do not serve blocks, and flow-control chatter from the
                // remote side needs no reaction.
                Message::KeepAlive
                | Message::Interested
                | Message::NotInterested
                | Message::Request { .. }
                | Message::Cancel { .. } => {
                    trace!(peer = %self.addr, ?message, "ignoring message")
                }
            }
        }
        self.running.store(false, Ordering::Release);
        debug!(peer = %self.addr, "peer session stopped");
    }

    /// Emits a KeepAlive every [`KEEPALIVE_INTERVAL`] while the session
    /// runs; a send failure ends the task.
    async fn heartbeat(self: Arc<Self>) {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            if !self.is_running() {
                return;
            }
            if let Err(e) = self.send(&Message::KeepAlive).await {
                debug!(peer = %self.addr, "heartbeat stopping: {e}");
                return;
            }
            trace!(peer = %self.addr, "keep-alive sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [0x11; 20];

    /// A scripted remote peer: completes the handshake, advertises pieces
    /// {0}, unchokes, then serves block requests from `piece_data`.
    async fn scripted_peer(piece_data: Vec<u8>, corrupt: bool) -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut hs = [0u8; 68];
            stream.read_exact(&mut hs).await.unwrap();
            let theirs = Handshake::parse(&hs).unwrap();
            stream
                .write_all(&Handshake::new(theirs.info_hash, [0xee; 20]).serialize())
                .await
                .unwrap();

            // The client opens with Interested.
            assert_eq!(
                Message::read(&mut stream).await.unwrap(),
                Message::Interested
            );

            stream
                .write_all(&Message::Bitfield(vec![0b1000_0000]).serialize())
                .await
                .unwrap();
            stream
                .write_all(&Message::Unchoke.serialize())
                .await
                .unwrap();

            loop {
                match Message::read(&mut stream).await {
                    Ok(Message::Request {
                        index,
                        begin,
                        length,
                    }) => {
                        let mut block = piece_data
                            [begin as usize..(begin + length) as usize]
                            .to_vec();
                        if corrupt {
                            block[0] ^= 0xff;
                        }
                        let reply = Message::Piece {
                            index,
                            begin,
                            block,
                        };
                        stream.write_all(&reply.serialize()).await.unwrap();
                    }
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        });
        addr
    }

    async fn wait_until_unchoked(session: &PeerSession) {
        for _ in 0..100 {
            if session.can_download() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer never unchoked us");
    }

    fn test_piece(data: &[u8]) -> Piece {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let mut checksum = [0u8; 20];
        checksum.copy_from_slice(&hasher.finalize());
        Piece::new(0, 0, data.len() as u32, checksum)
    }

    #[tokio::test]
    async fn downloads_and_verifies_a_piece() {
        // A piece of one full block plus a short tail.
        let data: Vec<u8> = (0..16_384 + 100u32).map(|i| i as u8).collect();
        let addr = scripted_peer(data.clone(), false).await;

        let session = PeerSession::connect(addr, INFO_HASH, [0x22; 20], 1)
            .await
            .unwrap();
        wait_until_unchoked(&session).await;
        assert!(session.has_piece(0).await);
        assert!(!session.has_piece(1).await);

        let piece = test_piece(&data);
        assert_eq!(piece.blocks.len(), 2);
        let got = session.download_piece(&piece).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn corrupted_piece_fails_the_checksum_gate() {
        let data: Vec<u8> = vec![0x5a; 4096];
        let addr = scripted_peer(data.clone(), true).await;

        let session = PeerSession::connect(addr, INFO_HASH, [0x22; 20], 1)
            .await
            .unwrap();
        wait_until_unchoked(&session).await;

        let err = session.download_piece(&test_piece(&data)).await.unwrap_err();
        assert!(matches!(err, PeerError::ChecksumMismatch(0)));
        assert!(!err.is_disconnect());
    }

    #[tokio::test]
    async fn mismatched_info_hash_aborts_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bad_addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs = [0u8; 68];
            stream.read_exact(&mut hs).await.unwrap();
            // Answer for some other torrent entirely.
            stream
                .write_all(&Handshake::new([0x99; 20], [0xee; 20]).serialize())
                .await
                .unwrap();
        });

        let err = PeerSession::connect(bad_addr, INFO_HASH, [0x22; 20], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::InfoHashMismatch));
    }
}

use anyhow::Result;
use clap::Parser;
use rs_dht_torrent::client::{ClientConfig, TorrentClient};
use rs_dht_torrent::torrent::file::TorrentFile;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Download a torrent, discovering peers over the mainline DHT.
#[derive(Debug, Parser)]
#[command(name = "rsdt", version, about)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory the downloaded file is written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// UDP port the DHT node listens on
    #[arg(long, default_value_t = 9999)]
    dht_port: u16,

    /// Stop topping up the peer pool once it holds this many peers
    #[arg(long, default_value_t = 15)]
    peer_pool_target: usize,

    /// Number of concurrent piece download workers
    #[arg(long, default_value_t = 150)]
    workers: usize,

    /// Node budget for each DHT bootstrap round
    #[arg(long, default_value_t = 100)]
    bootstrap_max_nodes: usize,

    /// Ask the HTTP tracker for peers when the DHT comes up empty
    #[arg(long)]
    use_tracker: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let torrent = TorrentFile::load(&args.torrent)?;
    println!("{torrent}");

    let config = ClientConfig {
        dht_port: args.dht_port,
        peer_pool_target: args.peer_pool_target,
        worker_count: args.workers,
        bootstrap_max_nodes: args.bootstrap_max_nodes,
        output_dir: args.output_dir,
        use_tracker: args.use_tracker,
    };
    TorrentClient::new(torrent, config).run().await
}

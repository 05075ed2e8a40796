use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::{net::TcpListener, sync::mpsc};
use url::Url;
use swarm::{
    net::Driver,
    tracker::{service, Tracker},
    BitfieldFill,
    Client,
    Config,
    EventKind,
    MetaInfo,
    PieceStore,
    SelectionPolicy,
    SwarmEvent,
    TorrentDescriptor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "BitTorrent swarm member and tracker.")]
struct Args {

    #[arg(long, default_value = "info", help = "trace, debug, info, warn or error")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {

    /// Share a file, writing its .torrent next to it.
    Seed {
        file: PathBuf,

        #[arg(long, help = "Announce url written into the torrent")]
        tracker: Option<Url>,

        #[arg(long, default_value_t = 262_144)]
        piece_length: u32,

        #[command(flatten)]
        peer: PeerArgs,
    },

    /// Download a torrent and keep seeding until interrupted.
    Leech {
        torrent: PathBuf,

        #[arg(short, long, help = "Output file (defaults to name from torrent)")]
        output: Option<PathBuf>,

        #[arg(long, help = "Exit once the download completes")]
        exit_on_complete: bool,

        #[command(flatten)]
        peer: PeerArgs,
    },

    /// Run an HTTP tracker for the given torrents.
    Tracker {
        #[arg(required = true)]
        torrents: Vec<PathBuf>,

        #[arg(long, default_value = "0.0.0.0:8000")]
        listen: SocketAddr,

        #[arg(long, default_value_t = 1800, help = "Announce interval in seconds")]
        interval: u64,
    },
}

#[derive(clap::Args, Debug)]
struct PeerArgs {

    #[arg(long, default_value = "0.0.0.0:6881")]
    listen: SocketAddr,

    #[arg(long, help = "Peers to dial besides those from the tracker")]
    connect: Vec<SocketAddr>,

    #[arg(long, help = "Use rarest first piece selection")]
    rarest_first: bool,

    #[arg(long, default_value_t = 4)]
    max_unchoked: usize,

    #[arg(long, help = "Seed for reproducible scheduling")]
    rng_seed: Option<u64>,
}

impl PeerArgs {
    fn config(&self) -> Result<Config> {
        let mut config = Config {
            listen_address: self.listen,
            rng_seed: self.rng_seed,
            ..Config::default()
        };
        if self.rarest_first {
            config.selection_policy = SelectionPolicy::RarestFirst;
        }
        if !config.set_max_unchoked_peers(self.max_unchoked) {
            bail!("invalid max unchoked peers: {}", self.max_unchoked);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {

    let args = Args::parse();

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    match args.command {
        Cmd::Seed { file, tracker, piece_length, peer } => seed(file, tracker, piece_length, peer).await,
        Cmd::Leech { torrent, output, exit_on_complete, peer } => leech(torrent, output, exit_on_complete, peer).await,
        Cmd::Tracker { torrents, listen, interval } => run_tracker(torrents, listen, interval).await,
    }
}

async fn seed(file: PathBuf, tracker: Option<Url>, piece_length: u32, peer: PeerArgs) -> Result<()> {
    if piece_length == 0 {
        bail!("piece length must be positive");
    }
    let data = std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
    if data.is_empty() {
        bail!("{} is empty", file.display());
    }
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());

    let metainfo = MetaInfo::from_data(&name, &data, piece_length, tracker);
    let torrent_path = file.with_extension("torrent");
    std::fs::write(&torrent_path, metainfo.to_bytes()?)
        .with_context(|| format!("failed to write {}", torrent_path.display()))?;
    println!("wrote {} ({})", torrent_path.display(), metainfo.info_hash_hex());

    let descriptor = Arc::new(TorrentDescriptor::new(&metainfo));
    let mut config = peer.config()?;
    config.initial_bitfield = BitfieldFill::Full;
    let store = PieceStore::from_data(descriptor.clone(), data)?;

    let mut driver = Driver::bind(Client::new(descriptor, store, config)).await?;
    for address in peer.connect.iter() {
        driver.connect(*address);
    }
    driver.run(ctrl_c()).await?;
    Ok(())
}

async fn leech(torrent: PathBuf, output: Option<PathBuf>, exit_on_complete: bool, peer: PeerArgs) -> Result<()> {
    let metainfo = MetaInfo::new(&torrent).with_context(|| format!("failed to parse {}", torrent.display()))?;
    let output = output.unwrap_or_else(|| PathBuf::from(metainfo.name()));
    let descriptor = Arc::new(TorrentDescriptor::new(&metainfo));
    let store = PieceStore::new_empty(descriptor.clone());

    let mut driver = Driver::bind(Client::new(descriptor, store, peer.config()?)).await?;
    for address in peer.connect.iter() {
        driver.connect(*address);
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    {
        let client = driver.client_mut();
        let num_pieces = client.descriptor().num_pieces;
        let mut done = 0;
        client.subscribe(EventKind::PieceComplete, Box::new(move |_: &SwarmEvent| {
            done += 1;
            println!("{}/{} pieces", done, num_pieces);
        }));
        client.subscribe(EventKind::DownloadComplete, Box::new(move |e: &SwarmEvent| {
            let _ = done_tx.send(e.clone());
        }));
    }

    let shutdown = async move {
        if exit_on_complete {
            tokio::select! {
                _ = done_rx.recv() => {},
                _ = ctrl_c() => {},
            }
        } else {
            ctrl_c().await;
        }
    };
    let client = driver.run(shutdown).await?;

    if client.is_seeding() {
        std::fs::write(&output, client.store().as_bytes())
            .with_context(|| format!("failed to write {}", output.display()))?;
        println!("saved {}", output.display());
    } else {
        let stats = client.stats();
        println!(
            "stopped with {}/{} pieces, nothing written",
            stats.piece_stats.num_downloaded,
            stats.piece_stats.num_pieces,
        );
    }
    Ok(())
}

async fn run_tracker(torrents: Vec<PathBuf>, listen: SocketAddr, interval: u64) -> Result<()> {
    if interval == 0 {
        bail!("announce interval must be positive");
    }
    let mut tracker = Tracker::new(Duration::from_secs(interval));
    for path in torrents.iter() {
        let metainfo = MetaInfo::new(path).with_context(|| format!("failed to parse {}", path.display()))?;
        println!("tracking {} ({})", metainfo.name(), metainfo.info_hash_hex());
        tracker.register(metainfo.info_hash());
    }

    let listener = TcpListener::bind(listen).await?;
    service::serve(listener, Arc::new(Mutex::new(tracker)), ctrl_c()).await?;
    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

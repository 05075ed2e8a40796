use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tokio_util::codec::{BytesCodec, FramedRead};
use crate::{outbox::Command, p2p::PeerKey, Client};

// Upper bound on how long the loop sleeps when no timer is armed.
const IDLE_WAKE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum NetError {

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

}

pub type Result<T> = std::result::Result<T, NetError>;

// Sent by peer and tracker tasks back to the driver loop.
#[derive(Debug)]
enum NetEvent {

    // Outbound transport is up.
    Connected { peer: PeerKey },

    Data { peer: PeerKey, data: Bytes },

    Closed { peer: PeerKey, error: Option<io::Error> },

    Tracker { ticket: u64, response: std::result::Result<Bytes, String> },

}

type NetTx = mpsc::UnboundedSender<NetEvent>;
type NetRx = mpsc::UnboundedReceiver<NetEvent>;

// Runs a client over real sockets. Peer connections and tracker requests
// each get their own task, everything they observe is funnelled back to the
// single loop that owns the client.
pub struct Driver {

    client: Client,

    listener: TcpListener,

    http: reqwest::Client,

    // Outgoing frames per peer task. Dropping the sender closes the socket
    // once everything queued is written.
    writers: HashMap<PeerKey, mpsc::UnboundedSender<Bytes>>,

    announces: HashMap<u64, JoinHandle<()>>,

    net_tx: NetTx,

    net_rx: NetRx,

}

impl Driver {

    // Binds the client's listen address.
    pub async fn bind(client: Client) -> Result<Self> {
        let listener = TcpListener::bind(client.config().listen_address).await?;
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            listener,
            http: reqwest::Client::builder().build()?,
            writers: HashMap::new(),
            announces: HashMap::new(),
            net_tx,
            net_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    // For subscribing to events and changing settings before the loop runs.
    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    // Dials a peer directly, outside of tracker discovery.
    pub fn connect(&mut self, address: SocketAddr) -> Option<PeerKey> {
        self.client.connect(address, Instant::now())
    }

    // Drives the client until `shutdown` resolves, then leaves the swarm and
    // hands the client back.
    pub async fn run<F>(mut self, shutdown: F) -> Result<Client>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!("listening on {}", self.listener.local_addr()?);
        self.client.start(Instant::now());
        self.dispatch();

        loop {
            let deadline = self.client
                .next_deadline()
                .map(time::Instant::from_std)
                .unwrap_or_else(|| time::Instant::now() + IDLE_WAKE);

            tokio::select! {

                _ = &mut shutdown => break,

                _ = time::sleep_until(deadline) => self.client.poll_timers(Instant::now()),

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        if let Some(peer) = self.client.accept(address, Instant::now()) {
                            self.spawn_peer(peer, address, Some(stream));
                        }
                    },
                    Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                },

                Some(event) = self.net_rx.recv() => self.on_net_event(event),
            }
            self.dispatch();
        }

        self.shutdown().await;
        Ok(self.client)
    }

    // Sends the stopped announce and gives it until the tracker timeout.
    async fn shutdown(&mut self) {
        tracing::info!("shutting down");
        self.client.stop(Instant::now());
        self.dispatch();
        self.writers.clear();

        let pending: Vec<JoinHandle<()>> = self.announces.drain().map(|(_, handle)| handle).collect();
        let timeout = self.client.config().tracker_timeout;
        if time::timeout(timeout, futures::future::join_all(pending)).await.is_err() {
            tracing::warn!("tracker did not answer stopped announce");
        }
    }

    fn on_net_event(&mut self, event: NetEvent) {
        let now = Instant::now();
        match event {

            NetEvent::Connected { peer } => self.client.on_connected(peer, now),

            NetEvent::Data { peer, data } => self.client.on_data(peer, &data, now),

            NetEvent::Closed { peer, error } => {
                self.writers.remove(&peer);
                self.client.on_closed(peer, error, now);
            },

            NetEvent::Tracker { ticket, response } => {
                if self.announces.remove(&ticket).is_some() {
                    self.client.on_tracker_response(ticket, response, now);
                }
            },
        }
    }

    // Carries out whatever the client asked for.
    fn dispatch(&mut self) {
        let commands: Vec<Command> = self.client.drain_commands().collect();
        for command in commands {
            match command {

                Command::Connect { peer, address } => self.spawn_peer(peer, address, None),

                Command::Send { peer, data } => {
                    if let Some(writer) = self.writers.get(&peer) {
                        // A closed task reports back through `Closed`.
                        let _ = writer.send(data);
                    }
                },

                Command::Close { peer } => {
                    self.writers.remove(&peer);
                },

                Command::Announce { ticket, url } => {
                    let http = self.http.clone();
                    let net_tx = self.net_tx.clone();
                    let handle = tokio::spawn(async move {
                        let response = announce(&http, &url).await.map_err(|e| e.to_string());
                        let _ = net_tx.send(NetEvent::Tracker { ticket, response });
                    });
                    self.announces.insert(ticket, handle);
                },

                Command::CancelAnnounce { ticket } => {
                    if let Some(handle) = self.announces.remove(&ticket) {
                        handle.abort();
                    }
                },
            }
        }
    }

    fn spawn_peer(&mut self, peer: PeerKey, address: SocketAddr, stream: Option<TcpStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.writers.insert(peer, tx);
        tokio::spawn(run_peer(peer, address, stream, rx, self.net_tx.clone()));
    }
}

async fn announce(http: &reqwest::Client, url: &str) -> Result<Bytes> {
    let response = http.get(url).send().await?;
    Ok(response.bytes().await?)
}

// Moves bytes between one socket and the driver. Framing is left to the
// client, this only reads and writes raw chunks.
#[tracing::instrument(name = "peer", skip(stream, outgoing, net_tx), fields(address = %address))]
async fn run_peer(
    peer: PeerKey,
    address: SocketAddr,
    stream: Option<TcpStream>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    net_tx: NetTx,
) {
    let stream = match stream {
        Some(stream) => stream,
        None => match TcpStream::connect(address).await {
            Ok(stream) => {
                tracing::trace!("outbound connection successful");
                let _ = net_tx.send(NetEvent::Connected { peer });
                stream
            },
            Err(e) => {
                tracing::debug!("connect failed: {}", e);
                let _ = net_tx.send(NetEvent::Closed { peer, error: Some(e) });
                return;
            },
        },
    };

    let (read, mut write) = stream.into_split();
    let mut frames = FramedRead::new(read, BytesCodec::new());

    let error = loop {
        tokio::select! {

            frame = frames.next() => match frame {
                Some(Ok(data)) => {
                    if net_tx.send(NetEvent::Data { peer, data: data.freeze() }).is_err() {
                        break None;
                    }
                },
                Some(Err(e)) => break Some(e),
                None => break None,
            },

            data = outgoing.recv() => match data {
                Some(data) => {
                    if let Err(e) = write.write_all(&data).await {
                        break Some(e);
                    }
                },
                // The driver closed this connection.
                None => {
                    let _ = write.shutdown().await;
                    break None;
                },
            },
        }
    };

    tracing::debug!("disconnected");
    let _ = net_tx.send(NetEvent::Closed { peer, error });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use crate::{BitfieldFill, Config, EventKind, MetaInfo, PieceStore, TorrentDescriptor};

    #[tokio::test]
    async fn test_download_over_loopback() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let metainfo = MetaInfo::from_data("loopback.bin", &data, 16_384, None);
        let descriptor = Arc::new(TorrentDescriptor::new(&metainfo));

        let seed_config = Config {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            initial_bitfield: BitfieldFill::Full,
            ..Config::default()
        };
        let store = PieceStore::from_data(descriptor.clone(), data.clone()).unwrap();
        let seeder = Driver::bind(Client::new(descriptor.clone(), store, seed_config)).await.unwrap();
        let seed_addr = seeder.local_addr().unwrap();

        let leech_config = Config {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        };
        let store = PieceStore::new_empty(descriptor.clone());
        let mut leecher = Driver::bind(Client::new(descriptor.clone(), store, leech_config)).await.unwrap();

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let mut done_tx = Some(done_tx);
        leecher.client_mut().subscribe(EventKind::DownloadComplete, Box::new(move |_: &crate::SwarmEvent| {
            if let Some(tx) = done_tx.take() {
                let _ = tx.send(());
            }
        }));
        assert!(leecher.connect(seed_addr).is_some());

        let (stop_seed, seed_stopped) = oneshot::channel::<()>();
        let seeding = tokio::spawn(seeder.run(async move {
            let _ = seed_stopped.await;
        }));
        let leeching = leecher.run(async move {
            let _ = done_rx.await;
        });

        let leecher = time::timeout(Duration::from_secs(20), leeching).await.unwrap().unwrap();
        assert!(leecher.is_seeding());
        assert_eq!(leecher.store().as_bytes(), &data[..]);

        let _ = stop_seed.send(());
        let seeder = seeding.await.unwrap().unwrap();
        assert_eq!(seeder.stats().uploaded, data.len() as u64);
    }
}

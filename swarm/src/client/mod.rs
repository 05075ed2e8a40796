use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use slotmap::SlotMap;
use crate::{
    block::{BlockData, BlockInfo},
    choker::ChokeScheduler,
    config::{BitfieldFill, Config, MAX_BLOCK_SIZE},
    event::{EventBus, EventKind, Subscriber, SubscriptionId, SwarmEvent},
    info::TorrentDescriptor,
    outbox::{Command, Outbox},
    p2p::{state::ConnState, PeerConnection, PeerContext, PeerError, PeerKey},
    picker::{RequestId, RequestScheduler},
    stats::{PeerStats, PieceStats, TorrentStats},
    store::PieceStore,
    time::TimerQueue,
    tracker::{keep_outbound, SwarmDiscovery},
    Bitfield,
};


const RATE_TICK: Duration = Duration::from_secs(1);

// Peers that don't finish the handshake in time are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// Everything the engine's components share. Each entry point sets `now`,
// components mutate the state and queue their effects in `out`.
pub(crate) struct Core {

    pub descriptor: Arc<TorrentDescriptor>,

    pub config: Config,

    // Pieces we have, verified.
    pub bitfield: Bitfield,

    pub store: PieceStore,

    pub peers: SlotMap<PeerKey, PeerConnection>,

    pub out: Outbox,

    pub timers: TimerQueue<Timer>,

    pub rng: StdRng,

    pub now: Instant,

    pub seeding: bool,

    // Block payload bytes over the client's lifetime.
    pub uploaded: u64,

    pub downloaded: u64,

}

// What a scheduled timer does once it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {

    ChokeRound,

    // Out of schedule choke round after a slot or interest change.
    EarlyChoke,

    PartSelection,

    RateTick,

    BlockTimeout(RequestId),

    Reannounce,

    TrackerTimeout(u64),

    ServeUploads(PeerKey),

}

// A swarm member for one torrent. Owns the local bitfield and the peer
// connections and routes every input through the request scheduler, the
// choke scheduler and then the subscribers.
//
// The client never touches the network. The driver feeds it transport
// events and carries out the commands it drains from it.
pub struct Client {

    core: Core,

    requests: RequestScheduler,

    choker: ChokeScheduler,

    discovery: SwarmDiscovery,

    bus: EventBus,

    started: bool,

}

impl Client {

    pub fn new(descriptor: Arc<TorrentDescriptor>, store: PieceStore, mut config: Config) -> Self {

        config.restore_invalid(&Config::default());

        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut bitfield = initial_bitfield(config.initial_bitfield, descriptor.num_pieces, &mut rng);
        if config.check_downloaded_data && bitfield.any() {
            let claimed: Vec<usize> = bitfield.iter_ones().collect();
            for idx in claimed {
                if !store.verify_piece(idx) {
                    tracing::warn!("piece {} failed hash check, not announcing it", idx);
                    bitfield.set(idx, false);
                }
            }
        }
        let seeding = bitfield.all();
        tracing::info!(
            "{}: {}/{} pieces{}",
            descriptor.name,
            bitfield.count_ones(),
            descriptor.num_pieces,
            if seeding { ", seeding" } else { "" },
        );

        let requests = RequestScheduler::new(&descriptor, &bitfield, &config);
        let discovery = SwarmDiscovery::new(config.candidate_cycles);

        Self {
            core: Core {
                descriptor,
                config,
                bitfield,
                store,
                peers: SlotMap::with_key(),
                out: Outbox::default(),
                timers: TimerQueue::new(),
                rng,
                now: Instant::now(),
                seeding,
                uploaded: 0,
                downloaded: 0,
            },
            requests,
            choker: ChokeScheduler::default(),
            discovery,
            bus: EventBus::default(),
            started: false,
        }
    }

    // Starts the periodic rounds and joins the swarm.
    pub fn start(&mut self, now: Instant) {
        self.core.now = now;
        if self.started {
            return;
        }
        self.started = true;

        let core = &mut self.core;
        core.timers.schedule_in(now, core.config.choke_interval, Timer::ChokeRound);
        core.timers.schedule_in(now, core.config.part_selection_interval, Timer::PartSelection);
        core.timers.schedule_in(now, RATE_TICK, Timer::RateTick);

        self.discovery.join_cloud(&mut self.core);
        self.process();
    }

    // Leaves the swarm and closes every connection.
    pub fn stop(&mut self, now: Instant) {
        self.core.now = now;
        if !self.started {
            return;
        }
        self.started = false;
        self.discovery.disconnect_from_cloud(&mut self.core);

        let peers: Vec<PeerKey> = self.core.peers.keys().collect();
        for peer in peers {
            self.close_peer(peer, None);
        }
        self.process();
    }

    fn peer_context(&self) -> PeerContext {
        let config = &self.core.config;
        PeerContext {
            info_hash: self.core.descriptor.info_hash,
            client_id: config.client_id,
            num_pieces: self.core.descriptor.num_pieces,
            rate_window: config.rate_window,
            send_empty_bitfield: config.send_empty_bitfield,
            max_message_len: (MAX_BLOCK_SIZE + 9).max((self.core.descriptor.num_pieces + 7) / 8 + 1),
        }
    }

    // Opens a connection to the address unless we already hold one to it or
    // are at the connection limit.
    pub fn connect(&mut self, address: SocketAddr, now: Instant) -> Option<PeerKey> {
        self.core.now = now;
        if self.discovery.is_held(&address) || self.core.peers.len() >= self.core.config.max_peers {
            return None;
        }
        let key = self.open(address);
        self.process();
        Some(key)
    }

    fn open(&mut self, address: SocketAddr) -> PeerKey {
        let ctx = self.peer_context();
        let now = self.core.now;
        let key = self.core.peers.insert_with_key(|key| PeerConnection::connect(key, address, ctx, now));
        self.discovery.add_pending(address, key);
        self.core.out.connect(key, address);
        key
    }

    // Registers an inbound connection. None means it should be refused.
    pub fn accept(&mut self, address: SocketAddr, now: Instant) -> Option<PeerKey> {
        self.core.now = now;
        if self.core.peers.len() >= self.core.config.max_peers {
            tracing::debug!("refusing {}, at connection limit", address);
            return None;
        }
        let ctx = self.peer_context();
        let key = self.core.peers.insert_with_key(|key| PeerConnection::accept(key, address, ctx, now));
        self.process();
        Some(key)
    }

    // The transport for an outbound connection is up.
    pub fn on_connected(&mut self, peer: PeerKey, now: Instant) {
        self.core.now = now;
        let core = &mut self.core;
        if let Some(p) = core.peers.get_mut(peer) {
            if let Err(e) = p.on_transport_connected(now) {
                p.close(Some(e), &mut core.out.events);
            }
        }
        self.process();
    }

    // The transport failed or was closed by the remote side.
    pub fn on_closed(&mut self, peer: PeerKey, error: Option<std::io::Error>, now: Instant) {
        self.core.now = now;
        self.close_peer(peer, error.map(PeerError::Io));
        self.process();
    }

    pub fn on_data(&mut self, peer: PeerKey, data: &[u8], now: Instant) {
        self.core.now = now;
        let core = &mut self.core;
        if let Some(p) = core.peers.get_mut(peer) {
            if let Err(e) = p.on_data(data, &core.bitfield, now, &mut core.out.events) {
                p.close(Some(e), &mut core.out.events);
            }
        }
        self.process();
    }

    // Result of an `Announce` command, the body or the reason it failed.
    pub fn on_tracker_response(&mut self, ticket: u64, response: Result<Bytes, String>, now: Instant) {
        self.core.now = now;
        self.discovery.on_announce_response(&mut self.core, ticket, response);
        self.process();
    }

    // Fires every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        self.core.now = now;
        while let Some((_, timer)) = self.core.timers.pop_expired(now) {
            self.on_timer(timer);
            self.process();
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.timers.next_deadline()
    }

    pub fn drain_commands(&mut self) -> impl Iterator<Item = Command> + '_ {
        self.core.out.commands.drain(..)
    }

    pub fn subscribe(&mut self, kind: EventKind, subscriber: Subscriber) -> SubscriptionId {
        self.bus.subscribe(kind, subscriber)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    // Applies settings, then brings the engine in line with whatever changed.
    // Invalid values keep their previous setting.
    pub fn update_config<F>(&mut self, now: Instant, update: F)
    where
        F: FnOnce(&mut Config),
    {
        self.core.now = now;
        let previous = self.core.config.clone();
        update(&mut self.core.config);
        self.core.config.restore_invalid(&previous);

        let block_size = self.core.config.request_block_size;
        self.requests.set_block_size(&mut self.core, block_size);
        let window = self.core.config.rate_window;
        for p in self.core.peers.values_mut() {
            p.throughput.set_window(window);
        }
        self.process();
    }

    // Changing block boundaries cancels every request in flight.
    pub fn set_request_block_size(&mut self, size: usize, now: Instant) -> bool {
        self.core.now = now;
        if !self.core.config.set_request_block_size(size) {
            return false;
        }
        self.requests.set_block_size(&mut self.core, size);
        self.process();
        true
    }

    // Extension protocol payloads are passed through untouched. Returns false
    // if the peer isn't connected.
    pub fn send_extended(&mut self, peer: PeerKey, id: u8, payload: Bytes, now: Instant) -> bool {
        self.core.now = now;
        let sent = match self.core.peers.get_mut(peer) {
            Some(p) if p.is_connected() => {
                p.send_extended(id, payload);
                true
            },
            _ => false,
        };
        self.flush();
        sent
    }

    pub fn scrape_url(&self) -> Option<url::Url> {
        self.core.descriptor.announce.as_ref().and_then(SwarmDiscovery::scrape_url)
    }

    pub fn descriptor(&self) -> &TorrentDescriptor {
        &self.core.descriptor
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.core.bitfield
    }

    pub fn is_seeding(&self) -> bool {
        self.core.seeding
    }

    pub fn store(&self) -> &PieceStore {
        &self.core.store
    }

    pub fn peer(&self, peer: PeerKey) -> Option<&PeerConnection> {
        self.core.peers.get(peer)
    }

    pub fn num_peers(&self) -> usize {
        self.core.peers.len()
    }

    pub fn stats(&self) -> TorrentStats {
        let core = &self.core;
        let peer_stats: Vec<PeerStats> = core.peers
            .values()
            .map(|p| PeerStats {
                address: p.address,
                conn_state: p.conn_state,
                state: p.state,
                outstanding_requests: self.requests.outstanding(p.key),
                up_rate: p.throughput.up.rate(),
                down_rate: p.throughput.down.rate(),
            })
            .collect();

        TorrentStats {
            name: core.descriptor.name.clone(),
            seeding: core.seeding,
            piece_stats: PieceStats {
                num_pieces: core.descriptor.num_pieces,
                num_pending: self.requests.num_pending(),
                num_downloaded: core.bitfield.count_ones(),
            },
            up_rate: peer_stats.iter().map(|p| p.up_rate).sum(),
            down_rate: peer_stats.iter().map(|p| p.down_rate).sum(),
            peer_stats,
            uploaded: core.uploaded,
            downloaded: core.downloaded,
        }
    }

    fn close_peer(&mut self, peer: PeerKey, error: Option<PeerError>) {
        let core = &mut self.core;
        if let Some(p) = core.peers.get_mut(peer) {
            p.close(error, &mut core.out.events);
        }
    }

    // Dispatches queued events until none are left, then hands pending
    // frames to the driver.
    fn process(&mut self) {
        while let Some(event) = self.core.out.events.pop_front() {
            if let Some(peer) = event.peer() {
                if !self.core.peers.contains_key(peer) {
                    continue;
                }
            }
            self.requests.handle(&mut self.core, &event);
            self.choker.handle(&mut self.core, &event);
            self.on_event(&event);
            self.bus.publish(&event);
        }
        self.flush();
    }

    fn flush(&mut self) {
        let core = &mut self.core;
        for (key, p) in core.peers.iter_mut() {
            if let Some(data) = p.take_outgoing(core.now) {
                core.out.send(key, data);
            }
        }
    }

    fn on_event(&mut self, event: &SwarmEvent) {
        match event {

            SwarmEvent::PeerConnected { peer, address, peer_id } => {
                self.discovery.on_connected(*address, *peer);
                self.resolve_duplicate(*peer, *peer_id);
            },

            SwarmEvent::PeerDisconnected { peer, address, .. } => {
                self.discovery.on_disconnected(*address, *peer);
                let core = &mut self.core;
                if let Some(mut p) = core.peers.remove(*peer) {
                    if p.conn_state == ConnState::Failed {
                        self.discovery.forget(address);
                    }
                    if let Some(data) = p.take_outgoing(core.now) {
                        core.out.send(*peer, data);
                    }
                    core.out.close(*peer);
                    if let Some(timer) = p.deinitialize() {
                        core.timers.cancel(timer);
                    }
                }
                self.refill();
            },

            SwarmEvent::BitfieldReceived { peer, .. } | SwarmEvent::Have { peer, .. } => {
                self.check_seeder(*peer);
            },

            SwarmEvent::BlockRequested { peer, block } => self.on_block_requested(*peer, *block),

            SwarmEvent::RequestCancelled { peer, block } => {
                if let Some(p) = self.core.peers.get_mut(*peer) {
                    p.upload_queue.retain(|queued| queued != block);
                }
            },

            SwarmEvent::DownloadComplete => {
                self.discovery.announce_as_seeder(&mut self.core);
                let seeders: Vec<PeerKey> = self.core.peers
                    .iter()
                    .filter(|(_, p)| p.is_connected() && p.is_seeder())
                    .map(|(key, _)| key)
                    .collect();
                for peer in seeders {
                    self.close_peer(peer, None);
                }
            },

            SwarmEvent::AnnounceSucceeded { .. } => self.refill(),

            SwarmEvent::Extended { peer, id, payload } => {
                tracing::debug!("extension message {} from {:?}, {} bytes", id, peer, payload.len());
            },

            SwarmEvent::PortReceived { peer, port } => {
                tracing::debug!("{:?} listens for DHT on port {}", peer, port);
            },

            _ => {},
        }
    }

    // Seeders have nothing to give each other.
    fn check_seeder(&mut self, peer: PeerKey) {
        let Some(p) = self.core.peers.get(peer) else { return };
        if !p.is_seeder() {
            return;
        }
        if p.outbound {
            self.discovery.mark_seeder(p.address);
        }
        if self.core.seeding {
            tracing::debug!("closing {}, both sides are seeding", p.address);
            self.close_peer(peer, None);
        }
    }

    // Both sides connected to each other at once. Keep exactly one of the
    // two connections, the same one the remote side keeps.
    fn resolve_duplicate(&mut self, peer: PeerKey, peer_id: crate::ID) {
        let core = &self.core;
        let Some(other) = core.peers
            .iter()
            .find(|(key, p)| *key != peer && p.is_connected() && p.peer_id == Some(peer_id))
            .map(|(key, _)| key)
        else {
            return;
        };
        let (Some(new), Some(old)) = (core.peers.get(peer), core.peers.get(other)) else { return };

        let loser = if new.outbound == old.outbound {
            // Not a crossed connect, the newer one goes.
            peer
        } else {
            let (outbound, inbound) = if new.outbound { (new, old) } else { (old, new) };
            let local = (core.config.listen_address, core.config.client_id);
            if keep_outbound(local, (outbound.address, peer_id)) {
                inbound.key
            } else {
                outbound.key
            }
        };
        tracing::debug!("duplicate connection to {}, closing {:?}", String::from_utf8_lossy(&peer_id), loser);
        self.close_peer(loser, None);
    }

    fn on_block_requested(&mut self, peer: PeerKey, block: BlockInfo) {
        let core = &mut self.core;
        let Some(p) = core.peers.get_mut(peer) else { return };

        let valid = block.len <= core.config.send_block_size
            && core.descriptor.is_valid_block(&block)
            && core.bitfield[block.piece_idx];
        if !valid {
            tracing::warn!("{} requested {:?} which we can't serve", p.address, block);
            p.close(Some(PeerError::InvalidRequest), &mut core.out.events);
            return;
        }
        if p.state.am_choking {
            tracing::debug!("ignoring request from choked peer {}", p.address);
            return;
        }
        if p.upload_queue.contains(&block) {
            return;
        }
        p.upload_queue.push_back(block);
        if p.serve_timer.is_none() {
            // Served in this tick, after any cancel that arrived with it.
            p.serve_timer = Some(core.timers.schedule(core.now, Timer::ServeUploads(peer)));
        }
    }

    fn serve_uploads(&mut self, peer: PeerKey) {
        let core = &mut self.core;
        let Some(p) = core.peers.get_mut(peer) else { return };
        p.serve_timer = None;
        if !p.is_connected() || p.state.am_choking {
            p.upload_queue.clear();
            return;
        }
        while let Some(block) = p.upload_queue.pop_front() {
            match core.store.read_block(&block) {
                Some(data) => {
                    core.uploaded += data.len() as u64;
                    p.send_block(BlockData {
                        piece_idx: block.piece_idx,
                        offset: block.offset,
                        data,
                    });
                },
                None => tracing::warn!("could not read {:?}", block),
            }
        }
    }

    // Tops connections up to the desired number from the tracker's candidates.
    fn refill(&mut self) {
        if !self.started {
            return;
        }
        let want = self.core.config.desired_peers.saturating_sub(self.discovery.num_held());
        if want == 0 {
            return;
        }
        let room = self.core.config.max_peers.saturating_sub(self.core.peers.len());
        for address in self.discovery.pick_candidates(&mut self.core, want.min(room)) {
            self.open(address);
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        let now = self.core.now;
        match timer {

            Timer::ChokeRound => {
                self.choker.run_round(&mut self.core, true);
                if self.started {
                    let interval = self.core.config.choke_interval;
                    self.core.timers.schedule_in(now, interval, Timer::ChokeRound);
                }
            },

            Timer::EarlyChoke => self.choker.on_early_run(&mut self.core),

            Timer::PartSelection => {
                self.requests.fill_all(&mut self.core);
                self.refill();
                if self.started {
                    let interval = self.core.config.part_selection_interval;
                    self.core.timers.schedule_in(now, interval, Timer::PartSelection);
                }
            },

            Timer::RateTick => {
                self.on_rate_tick();
                if self.started {
                    self.core.timers.schedule_in(now, RATE_TICK, Timer::RateTick);
                }
            },

            Timer::BlockTimeout(id) => self.requests.on_block_timeout(&mut self.core, id),

            Timer::Reannounce => self.discovery.on_reannounce(&mut self.core),

            Timer::TrackerTimeout(ticket) => self.discovery.on_tracker_timeout(&mut self.core, ticket),

            Timer::ServeUploads(peer) => self.serve_uploads(peer),
        }
    }

    // Closes the per-second rate buckets, keeps quiet connections alive and
    // drops the ones going nowhere.
    fn on_rate_tick(&mut self) {
        let core = &mut self.core;
        let now = core.now;
        let keep_alive = core.config.keep_alive_interval;
        let idle_timeout = core.config.idle_timeout;

        let mut stalled = Vec::new();
        let mut idle = Vec::new();
        for (key, p) in core.peers.iter_mut() {
            p.throughput.tick();
            if p.needs_keep_alive(now, keep_alive) {
                p.send_keep_alive();
            }
            if p.conn_state == ConnState::AwaitHandshake {
                let waited = p.connected_at.map(|t| now.saturating_duration_since(t)).unwrap_or_default();
                if waited >= HANDSHAKE_TIMEOUT {
                    stalled.push(key);
                }
            }
            if let Some(timeout) = idle_timeout {
                if p.is_idle(now, timeout) {
                    idle.push(key);
                }
            }
        }

        for peer in stalled {
            self.close_peer(peer, Some(PeerError::Timeout));
        }
        for peer in idle {
            tracing::debug!("closing idle peer {:?}", peer);
            self.close_peer(peer, None);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.core.descriptor.name)
            .field("pieces", &self.core.bitfield.count_ones())
            .field("peers", &self.core.peers.len())
            .field("seeding", &self.core.seeding)
            .finish()
    }
}

// Local bitfield the client starts out with.
fn initial_bitfield(fill: BitfieldFill, num_pieces: usize, rng: &mut StdRng) -> Bitfield {
    let mut bitfield = Bitfield::repeat(false, num_pieces);
    match fill {
        BitfieldFill::Empty => {},
        BitfieldFill::Full => bitfield.fill(true),
        BitfieldFill::Random { percent } => {
            let p = f64::from(percent.min(100)) / 100.0;
            for idx in 0..num_pieces {
                bitfield.set(idx, rng.gen_bool(p));
            }
        },
        BitfieldFill::LeftFill { percent, tail_percent } => {
            let head = num_pieces * usize::from(percent.min(100)) / 100;
            let p = f64::from(tail_percent.min(100)) / 100.0;
            bitfield[..head].fill(true);
            for idx in head..num_pieces {
                bitfield.set(idx, rng.gen_bool(p));
            }
        },
    }
    bitfield
}

use std::collections::VecDeque;
use crate::p2p::state::{ConnState, SessionState};

// Snapshot returned by `Client::stats`.
#[derive(Debug, Clone, Default)]
pub struct TorrentStats {

    pub name: String,

    pub seeding: bool,

    pub piece_stats: PieceStats,

    pub peer_stats: Vec<PeerStats>,

    // Bytes of block payload sent and received over the client's lifetime.
    pub uploaded: u64,

    pub downloaded: u64,

    // Sum of per-peer rates, bytes per second.
    pub up_rate: f64,

    pub down_rate: f64,

}

#[derive(Debug, Clone, Copy, Default)]
pub struct PieceStats {

    pub num_pieces: usize,

    // Needed pieces with at least one request in flight.
    pub num_pending: usize,

    pub num_downloaded: usize,

}

impl PieceStats {
    pub fn is_seed(&self) -> bool {
        self.num_downloaded == self.num_pieces
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeerStats {

    pub address: std::net::SocketAddr,

    pub conn_state: ConnState,

    pub state: SessionState,

    pub outstanding_requests: usize,

    pub up_rate: f64,

    pub down_rate: f64,

}

#[derive(Debug, Clone)]
pub struct ThroughputStats {

    pub up: RateHistory,

    pub down: RateHistory,

}

impl ThroughputStats {

    pub fn new(window: usize) -> Self {
        Self {
            up: RateHistory::new(window),
            down: RateHistory::new(window),
        }
    }

    // Closes the current one second bucket in both directions.
    pub fn tick(&mut self) {
        self.up.tick();
        self.down.tick();
    }

    pub fn set_window(&mut self, window: usize) {
        self.up.set_window(window);
        self.down.set_window(window);
    }
}

// Per-second byte counters over a sliding window.
#[derive(Debug, Clone)]
pub struct RateHistory {
    window: usize,
    history: VecDeque<u64>,
    current: u64,
    total: u64,
}

impl RateHistory {

    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: VecDeque::with_capacity(window),
            current: 0,
            total: 0,
        }
    }

    pub fn add(&mut self, n: u64) {
        self.current += n;
        self.total += n;
    }

    pub fn tick(&mut self) {
        self.history.push_back(self.current);
        self.current = 0;
        while self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    pub fn set_window(&mut self, window: usize) {
        self.window = window.max(1);
        while self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    // Average bytes per second over the recorded part of the window.
    pub fn rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<u64>() as f64 / self.history.len() as f64
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl std::ops::AddAssign<u64> for RateHistory {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

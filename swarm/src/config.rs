use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use rand::Rng;
use crate::{BLOCK_SIZE, ID};

// Largest block we will ever request or serve, anything above this is
// refused by most clients.
pub const MAX_BLOCK_SIZE: usize = 0x20000;

const CLIENT_PREFIX: &[u8; 8] = b"-SW0100-";

// How the next block is chosen for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {

    // First allowed block in piece index order.
    #[default]
    Sequential,

    // Finish pieces in flight with the peer, then pick randomly among the
    // least replicated pieces the peer has.
    RarestFirst,

}

// Metric used to rank peers when handing out upload slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChokeMetric {

    // Download rate from the peer while leeching, upload rate to it while seeding.
    #[default]
    Auto,

    DownloadRate,

    UploadRate,

}

// Which pieces the local bitfield starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitfieldFill {

    #[default]
    Empty,

    Full,

    // Each piece is owned with the given probability.
    Random { percent: u8 },

    // The leading `percent` of pieces are owned, the remainder are owned
    // with probability `tail_percent`.
    LeftFill { percent: u8, tail_percent: u8 },

}

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: ID,

    pub listen_address: SocketAddr,

    // Number of connections we try to keep open.
    pub desired_peers: usize,

    // Hard limit on open and pending connections.
    pub max_peers: usize,

    // Upload slots, not counting the optimistic unchoke.
    pub max_unchoked_peers: usize,

    pub max_requests_per_peer: usize,

    pub max_requests_per_piece: usize,

    // Peers that may be asked for the same block at once.
    pub max_requests_per_block: usize,

    pub max_requests_per_peer_per_piece: usize,

    pub request_block_size: usize,

    // Largest request we will serve.
    pub send_block_size: usize,

    // Budget for a whole piece, split across its blocks.
    pub piece_timeout: Duration,

    // Verify pieces against their hash before marking them complete.
    pub check_downloaded_data: bool,

    pub choke_interval: Duration,

    // Optimistic unchoke is reconsidered every this many choke rounds.
    pub optimistic_multiple: u32,

    pub part_selection_interval: Duration,

    // Used until the tracker supplies its own interval.
    pub announce_interval: Duration,

    pub tracker_timeout: Duration,

    // Seconds averaged over for throughput estimates.
    pub rate_window: usize,

    pub idle_timeout: Option<Duration>,

    pub keep_alive_interval: Duration,

    // Announce cycles a tracker supplied address stays a candidate.
    pub candidate_cycles: usize,

    pub num_want: usize,

    pub selection_policy: SelectionPolicy,

    pub choke_metric: ChokeMetric,

    pub initial_bitfield: BitfieldFill,

    // Peers with no pieces aren't required to send a bitfield.
    pub send_empty_bitfield: bool,

    // Seed for scheduling randomness, for reproducible runs.
    pub rng_seed: Option<u64>,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: generate_peer_id(),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            desired_peers: 20,
            max_peers: 50,
            max_unchoked_peers: 4,
            max_requests_per_peer: 10,
            max_requests_per_piece: 16,
            max_requests_per_block: 1,
            max_requests_per_peer_per_piece: 4,
            request_block_size: BLOCK_SIZE,
            send_block_size: MAX_BLOCK_SIZE,
            piece_timeout: Duration::from_secs(60),
            check_downloaded_data: true,
            choke_interval: Duration::from_secs(10),
            optimistic_multiple: 3,
            part_selection_interval: Duration::from_secs(5),
            announce_interval: Duration::from_secs(1800),
            tracker_timeout: Duration::from_secs(30),
            rate_window: 20,
            idle_timeout: Some(Duration::from_secs(120)),
            keep_alive_interval: Duration::from_secs(120),
            candidate_cycles: 3,
            num_want: 50,
            selection_policy: SelectionPolicy::default(),
            choke_metric: ChokeMetric::default(),
            initial_bitfield: BitfieldFill::default(),
            send_empty_bitfield: true,
            rng_seed: None,
        }
    }
}

// Azureus style peer id: client prefix followed by random alphanumerics.
pub fn generate_peer_id() -> ID {
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.sample(rand::distributions::Alphanumeric);
    }
    id
}

// Applies a setting only if it passed validation.
fn apply<T: std::fmt::Debug>(name: &str, field: &mut T, value: T, valid: bool) -> bool {
    if !valid {
        tracing::warn!("ignoring invalid {}: {:?}", name, value);
        return false;
    }
    *field = value;
    true
}

// Puts `fallback` back if the field was written with an invalid value.
fn restore<T: std::fmt::Debug + Clone>(name: &str, field: &mut T, fallback: &T, valid: fn(&T) -> bool) -> bool {
    if valid(field) {
        return false;
    }
    tracing::warn!("ignoring invalid {}: {:?}, keeping {:?}", name, field, fallback);
    *field = fallback.clone();
    true
}

fn positive(n: &usize) -> bool {
    *n > 0
}

fn block_size(n: &usize) -> bool {
    *n > 0 && *n <= MAX_BLOCK_SIZE
}

fn non_zero(d: &Duration) -> bool {
    !d.is_zero()
}

// Setters reject values that would stall the engine and leave the old value in place.
impl Config {

    pub fn set_desired_peers(&mut self, n: usize) -> bool {
        apply("desired peers", &mut self.desired_peers, n, positive(&n))
    }

    pub fn set_max_peers(&mut self, n: usize) -> bool {
        apply("max peers", &mut self.max_peers, n, positive(&n))
    }

    pub fn set_max_unchoked_peers(&mut self, n: usize) -> bool {
        apply("max unchoked peers", &mut self.max_unchoked_peers, n, positive(&n))
    }

    pub fn set_max_requests_per_peer(&mut self, n: usize) -> bool {
        apply("max requests per peer", &mut self.max_requests_per_peer, n, positive(&n))
    }

    pub fn set_max_requests_per_piece(&mut self, n: usize) -> bool {
        apply("max requests per piece", &mut self.max_requests_per_piece, n, positive(&n))
    }

    pub fn set_max_requests_per_block(&mut self, n: usize) -> bool {
        apply("max requests per block", &mut self.max_requests_per_block, n, positive(&n))
    }

    pub fn set_max_requests_per_peer_per_piece(&mut self, n: usize) -> bool {
        apply("max requests per peer per piece", &mut self.max_requests_per_peer_per_piece, n, positive(&n))
    }

    pub fn set_request_block_size(&mut self, size: usize) -> bool {
        apply("request block size", &mut self.request_block_size, size, block_size(&size))
    }

    pub fn set_send_block_size(&mut self, size: usize) -> bool {
        apply("send block size", &mut self.send_block_size, size, block_size(&size))
    }

    pub fn set_piece_timeout(&mut self, timeout: Duration) -> bool {
        apply("piece timeout", &mut self.piece_timeout, timeout, non_zero(&timeout))
    }

    pub fn set_choke_interval(&mut self, interval: Duration) -> bool {
        apply("choke interval", &mut self.choke_interval, interval, non_zero(&interval))
    }

    pub fn set_optimistic_multiple(&mut self, n: u32) -> bool {
        apply("optimistic multiple", &mut self.optimistic_multiple, n, n > 0)
    }

    pub fn set_part_selection_interval(&mut self, interval: Duration) -> bool {
        apply("part selection interval", &mut self.part_selection_interval, interval, non_zero(&interval))
    }

    pub fn set_announce_interval(&mut self, interval: Duration) -> bool {
        apply("announce interval", &mut self.announce_interval, interval, non_zero(&interval))
    }

    pub fn set_rate_window(&mut self, secs: usize) -> bool {
        apply("rate window", &mut self.rate_window, secs, positive(&secs))
    }

    // Fields are public, so values can reach the engine without passing a
    // setter. Every field a setter would refuse is reset to its value in
    // `fallback`. Returns how many were reset.
    pub fn restore_invalid(&mut self, fallback: &Config) -> usize {
        let restored = [
            restore("desired peers", &mut self.desired_peers, &fallback.desired_peers, positive),
            restore("max peers", &mut self.max_peers, &fallback.max_peers, positive),
            restore("max unchoked peers", &mut self.max_unchoked_peers, &fallback.max_unchoked_peers, positive),
            restore("max requests per peer", &mut self.max_requests_per_peer, &fallback.max_requests_per_peer, positive),
            restore("max requests per piece", &mut self.max_requests_per_piece, &fallback.max_requests_per_piece, positive),
            restore("max requests per block", &mut self.max_requests_per_block, &fallback.max_requests_per_block, positive),
            restore(
                "max requests per peer per piece",
                &mut self.max_requests_per_peer_per_piece,
                &fallback.max_requests_per_peer_per_piece,
                positive,
            ),
            restore("request block size", &mut self.request_block_size, &fallback.request_block_size, block_size),
            restore("send block size", &mut self.send_block_size, &fallback.send_block_size, block_size),
            restore("piece timeout", &mut self.piece_timeout, &fallback.piece_timeout, non_zero),
            restore("choke interval", &mut self.choke_interval, &fallback.choke_interval, non_zero),
            restore("optimistic multiple", &mut self.optimistic_multiple, &fallback.optimistic_multiple, |n: &u32| *n > 0),
            restore("part selection interval", &mut self.part_selection_interval, &fallback.part_selection_interval, non_zero),
            restore("announce interval", &mut self.announce_interval, &fallback.announce_interval, non_zero),
            restore("tracker timeout", &mut self.tracker_timeout, &fallback.tracker_timeout, non_zero),
            restore("keep alive interval", &mut self.keep_alive_interval, &fallback.keep_alive_interval, non_zero),
            restore("rate window", &mut self.rate_window, &fallback.rate_window, positive),
        ];
        restored.iter().filter(|r| **r).count()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_settings_ignored() {
        let mut config = Config::default();
        assert!(!config.set_request_block_size(0));
        assert_eq!(config.request_block_size, BLOCK_SIZE);
        assert!(!config.set_request_block_size(MAX_BLOCK_SIZE + 1));
        assert!(!config.set_choke_interval(Duration::ZERO));
        assert_eq!(config.choke_interval, Duration::from_secs(10));
        assert!(!config.set_max_requests_per_block(0));
        assert_eq!(config.max_requests_per_block, 1);
    }

    #[test]
    fn test_valid_settings_applied() {
        let mut config = Config::default();
        assert!(config.set_request_block_size(0x8000));
        assert_eq!(config.request_block_size, 0x8000);
        assert!(config.set_max_unchoked_peers(8));
        assert_eq!(config.max_unchoked_peers, 8);
    }

    #[test]
    fn test_restore_invalid_fields() {
        let fallback = Config::default();
        let mut config = Config {
            request_block_size: 0,
            max_requests_per_peer: 0,
            choke_interval: Duration::ZERO,
            max_unchoked_peers: 7,
            ..fallback.clone()
        };
        assert_eq!(config.restore_invalid(&fallback), 3);
        assert_eq!(config.request_block_size, BLOCK_SIZE);
        assert_eq!(config.max_requests_per_peer, 10);
        assert_eq!(config.choke_interval, Duration::from_secs(10));
        // Valid changes survive.
        assert_eq!(config.max_unchoked_peers, 7);
        assert_eq!(config.restore_invalid(&fallback), 0);
    }

    #[test]
    fn test_peer_id_prefix() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(&a[..8], CLIENT_PREFIX);
        assert!(a[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}

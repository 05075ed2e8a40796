use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    time::Duration,
};
use bytes::Bytes;
use rand::seq::SliceRandom;
use url::Url;
use crate::{
    client::{Core, Timer},
    event::SwarmEvent,
    p2p::PeerKey,
    time::TimerId,
    ID,
};
use super::{AnnounceParams, AnnounceResponse, Event, TrackerError};

// First retry after a failed announce, doubled on every further failure.
const RETRY_BASE: Duration = Duration::from_secs(15);

// Addresses learned from the tracker, one entry per announce cycle. The
// oldest cycle falls out once `max_cycles` newer ones arrived.
#[derive(Debug, Clone)]
pub struct CandidateCache {
    cycles: VecDeque<Vec<SocketAddr>>,
    max_cycles: usize,
}

impl CandidateCache {

    pub fn new(max_cycles: usize) -> Self {
        Self {
            cycles: VecDeque::new(),
            max_cycles: max_cycles.max(1),
        }
    }

    pub fn refresh(&mut self, addresses: Vec<SocketAddr>) {
        self.cycles.push_front(addresses);
        self.cycles.truncate(self.max_cycles);
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.cycles.iter().any(|cycle| cycle.contains(address))
    }

    // Distinct addresses, newest first.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        self.cycles
            .iter()
            .flatten()
            .filter(|addr| seen.insert(**addr))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.addresses().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.iter().all(|cycle| cycle.is_empty())
    }

    pub fn remove(&mut self, address: &SocketAddr) {
        for cycle in self.cycles.iter_mut() {
            cycle.retain(|addr| addr != address);
        }
    }
}

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    event: Option<Event>,
    timeout: TimerId,
}

// Talks to the tracker and keeps track of who we are, or are about to be,
// connected to. Only one announce is ever in flight.
#[derive(Debug)]
pub(crate) struct SwarmDiscovery {

    connected: HashMap<SocketAddr, PeerKey>,

    // Outbound connects not yet handshaken.
    pending: HashMap<SocketAddr, PeerKey>,

    // Addresses known to have the whole file.
    seeders: HashSet<SocketAddr>,

    candidates: CandidateCache,

    // Interval supplied by the tracker, replaces the configured one.
    interval: Option<Duration>,

    min_interval: Option<Duration>,

    tracker_id: Option<String>,

    in_flight: Option<InFlight>,

    reannounce: Option<TimerId>,

    // Event of a failed announce, sent again with the retry.
    retry_event: Option<Event>,

    failures: u32,

    next_ticket: u64,

    stopped: bool,

}

impl SwarmDiscovery {

    pub fn new(candidate_cycles: usize) -> Self {
        Self {
            connected: HashMap::new(),
            pending: HashMap::new(),
            seeders: HashSet::new(),
            candidates: CandidateCache::new(candidate_cycles),
            interval: None,
            min_interval: None,
            tracker_id: None,
            in_flight: None,
            reannounce: None,
            retry_event: None,
            failures: 0,
            next_ticket: 0,
            stopped: false,
        }
    }

    pub fn join_cloud(&mut self, core: &mut Core) {
        self.stopped = false;
        self.announce(core, Some(Event::Started));
    }

    pub fn announce_as_seeder(&mut self, core: &mut Core) {
        self.announce(core, Some(Event::Completed));
    }

    pub fn disconnect_from_cloud(&mut self, core: &mut Core) {
        if let Some(timer) = self.reannounce.take() {
            core.timers.cancel(timer);
        }
        self.announce(core, Some(Event::Stopped));
        self.stopped = true;
    }

    pub fn announce(&mut self, core: &mut Core, event: Option<Event>) {

        if self.stopped {
            tracing::debug!("left the swarm, not announcing {:?}", event);
            return;
        }
        let Some(base) = core.descriptor.announce.clone() else {
            tracing::debug!("no announce url, skipping announce");
            return;
        };

        // A regular update never replaces a start, stop or complete.
        if let Some(current) = self.in_flight.take() {
            if Event::priority(event) <= Event::priority(current.event) {
                tracing::debug!("announce {:?} in flight, skipping {:?}", current.event, event);
                self.in_flight = Some(current);
                return;
            }
            tracing::debug!("announce {:?} supersedes {:?}", event, current.event);
            core.timers.cancel(current.timeout);
            core.out.cancel_announce(current.ticket);
        }
        if let Some(timer) = self.reannounce.take() {
            core.timers.cancel(timer);
        }

        let left: u64 = core.bitfield
            .iter_zeros()
            .map(|idx| core.descriptor.piece_len(idx) as u64)
            .sum();
        let params = AnnounceParams {
            info_hash: core.descriptor.info_hash,
            client_id: core.config.client_id,
            port: core.config.listen_address.port(),
            uploaded: core.uploaded,
            downloaded: core.downloaded,
            left,
            event,
            num_want: Some(if event == Some(Event::Stopped) { 0 } else { core.config.num_want }),
            tracker_id: self.tracker_id.clone(),
        };

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let url = params.url(&base);
        tracing::debug!("announcing {:?} to {}", event, base);
        core.out.announce(ticket, url);

        let timeout = core.timers.schedule_in(core.now, core.config.tracker_timeout, Timer::TrackerTimeout(ticket));
        self.in_flight = Some(InFlight { ticket, event, timeout });
    }

    pub fn on_announce_response(&mut self, core: &mut Core, ticket: u64, body: Result<Bytes, String>) {
        if self.in_flight.as_ref().map(|f| f.ticket) != Some(ticket) {
            tracing::debug!("ignoring stale tracker response {}", ticket);
            return;
        }
        let Some(flight) = self.in_flight.take() else { return };
        core.timers.cancel(flight.timeout);

        let response = body
            .map_err(TrackerError::RequestError)
            .and_then(|raw| AnnounceResponse::from_bytes(&raw));
        match response {
            Ok(response) => self.on_success(core, flight.event, response),
            Err(e) => self.on_failure(core, flight.event, e),
        }
    }

    pub fn on_tracker_timeout(&mut self, core: &mut Core, ticket: u64) {
        if self.in_flight.as_ref().map(|f| f.ticket) != Some(ticket) {
            return;
        }
        let Some(flight) = self.in_flight.take() else { return };
        core.out.cancel_announce(flight.ticket);
        self.on_failure(core, flight.event, TrackerError::Timeout);
    }

    pub fn on_reannounce(&mut self, core: &mut Core) {
        self.reannounce = None;
        let event = self.retry_event.take();
        self.announce(core, event);
    }

    fn on_success(&mut self, core: &mut Core, event: Option<Event>, response: AnnounceResponse) {

        self.failures = 0;
        if let Some(warning) = &response.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }
        if let Some(interval) = response.interval {
            self.interval = Some(Duration::from_secs(interval));
        }
        if let Some(min_interval) = response.min_interval {
            self.min_interval = Some(Duration::from_secs(min_interval));
        }
        if response.tracker_id.is_some() {
            self.tracker_id = response.tracker_id.clone();
        }

        let own = core.config.listen_address;
        let peers: Vec<SocketAddr> = response.peers
            .into_iter()
            .filter(|addr| *addr != own)
            .collect();
        let num_peers = peers.len();
        tracing::info!(
            "announce {:?} ok: {} peers, {} seeders, {} leechers",
            event,
            num_peers,
            response.complete.unwrap_or(0),
            response.incomplete.unwrap_or(0),
        );
        self.candidates.refresh(peers);

        core.out.event(SwarmEvent::AnnounceSucceeded {
            seeders: response.complete.unwrap_or(0),
            leechers: response.incomplete.unwrap_or(0),
            peers: num_peers,
        });

        if event != Some(Event::Stopped) {
            let interval = self.announce_interval(core);
            self.schedule_reannounce(core, interval);
        }
    }

    fn on_failure(&mut self, core: &mut Core, event: Option<Event>, error: TrackerError) {
        tracing::warn!("announce {:?} failed: {}", event, error);
        core.out.event(SwarmEvent::AnnounceFailed { reason: error.to_string() });
        if event == Some(Event::Stopped) {
            return;
        }

        self.failures += 1;
        if Event::priority(event) > Event::priority(self.retry_event) {
            self.retry_event = event;
        }
        let backoff = RETRY_BASE
            .saturating_mul(1 << (self.failures - 1).min(10))
            .min(self.announce_interval(core));
        self.schedule_reannounce(core, backoff);
    }

    fn announce_interval(&self, core: &Core) -> Duration {
        let interval = self.interval.unwrap_or(core.config.announce_interval);
        match self.min_interval {
            Some(min) => interval.max(min),
            None => interval,
        }
    }

    fn schedule_reannounce(&mut self, core: &mut Core, delay: Duration) {
        if let Some(timer) = self.reannounce.take() {
            core.timers.cancel(timer);
        }
        tracing::debug!("next announce in {:?}", delay);
        self.reannounce = Some(core.timers.schedule_in(core.now, delay, Timer::Reannounce));
    }

    pub fn is_announcing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn candidates(&self) -> &CandidateCache {
        &self.candidates
    }

    // Uniform draw from the candidates not yet connected or pending, no more
    // than the connection limit leaves room for.
    pub fn pick_candidates(&self, core: &mut Core, count: usize) -> Vec<SocketAddr> {
        let held = self.connected.len() + self.pending.len();
        let room = core.config.max_peers.saturating_sub(held).min(count);
        if room == 0 {
            return Vec::new();
        }
        let own = core.config.listen_address;
        let mut pool: Vec<SocketAddr> = self.candidates
            .addresses()
            .into_iter()
            .filter(|addr| !self.connected.contains_key(addr) && !self.pending.contains_key(addr))
            .filter(|addr| !(core.seeding && self.seeders.contains(addr)))
            .filter(|addr| *addr != own)
            .collect();
        pool.shuffle(&mut core.rng);
        pool.truncate(room);
        pool
    }

    pub fn num_held(&self) -> usize {
        self.connected.len() + self.pending.len()
    }

    pub fn add_pending(&mut self, address: SocketAddr, peer: PeerKey) {
        self.pending.insert(address, peer);
    }

    pub fn on_connected(&mut self, address: SocketAddr, peer: PeerKey) {
        self.pending.remove(&address);
        self.connected.insert(address, peer);
    }

    pub fn on_disconnected(&mut self, address: SocketAddr, peer: PeerKey) {
        // A replacement connection may already hold the address.
        if self.pending.get(&address) == Some(&peer) {
            self.pending.remove(&address);
        }
        if self.connected.get(&address) == Some(&peer) {
            self.connected.remove(&address);
        }
    }

    pub fn is_held(&self, address: &SocketAddr) -> bool {
        self.connected.contains_key(address) || self.pending.contains_key(address)
    }

    // Unreachable address, don't try it again until the tracker hands it out anew.
    pub fn forget(&mut self, address: &SocketAddr) {
        self.candidates.remove(address);
    }

    pub fn mark_seeder(&mut self, address: SocketAddr) {
        self.seeders.insert(address);
    }

    pub fn is_seeder(&self, address: &SocketAddr) -> bool {
        self.seeders.contains(address)
    }

    // Scrape lives next to announce by convention, trackers without an
    // `announce` path segment don't support it.
    pub fn scrape_url(announce: &Url) -> Option<Url> {
        let last = announce.path_segments()?.last()?;
        if !last.starts_with("announce") {
            return None;
        }
        let scrape = last.replacen("announce", "scrape", 1);
        let mut url = announce.clone();
        url.path_segments_mut().ok()?.pop().push(&scrape);
        Some(url)
    }
}

// Two peers that dialed each other at the same time end up with two
// connections. Both sides keep the one opened by the peer with the higher
// (address, id), so they agree without talking about it.
pub fn keep_outbound(local: (SocketAddr, ID), remote: (SocketAddr, ID)) -> bool {
    let (local_addr, local_id) = local;
    let (remote_addr, remote_id) = remote;
    if local_addr.ip().is_unspecified() {
        // Our own ip is unknown, fall back to what both sides can see.
        return (local_addr.port(), local_id) > (remote_addr.port(), remote_id);
    }
    (local_addr.ip(), local_addr.port(), local_id) > (remote_addr.ip(), remote_addr.port(), remote_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_candidates_age_out() {
        let mut cache = CandidateCache::new(2);
        cache.refresh(vec![addr("10.0.0.1:1"), addr("10.0.0.2:1")]);
        cache.refresh(vec![addr("10.0.0.2:1"), addr("10.0.0.3:1")]);
        assert_eq!(cache.len(), 3);
        cache.refresh(vec![addr("10.0.0.4:1")]);
        // The first cycle is gone, 10.0.0.2 survives through the second.
        assert!(!cache.contains(&addr("10.0.0.1:1")));
        assert!(cache.contains(&addr("10.0.0.2:1")));
        assert_eq!(cache.addresses(), vec![addr("10.0.0.4:1"), addr("10.0.0.2:1"), addr("10.0.0.3:1")]);
    }

    #[test]
    fn test_candidate_remove() {
        let mut cache = CandidateCache::new(3);
        cache.refresh(vec![addr("10.0.0.1:1")]);
        cache.refresh(vec![addr("10.0.0.1:1")]);
        cache.remove(&addr("10.0.0.1:1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_tie_break_agrees() {
        let a = (addr("10.0.0.1:6881"), *b"-SW0100-aaaaaaaaaaaa");
        let b = (addr("10.0.0.2:6881"), *b"-SW0100-bbbbbbbbbbbb");
        // Exactly one side keeps its outbound connection.
        assert!(!keep_outbound(a, b));
        assert!(keep_outbound(b, a));

        let a = (addr("0.0.0.0:7000"), *b"-SW0100-aaaaaaaaaaaa");
        let b = (addr("10.0.0.2:6881"), *b"-SW0100-bbbbbbbbbbbb");
        assert!(keep_outbound(a, b));
    }

    #[test]
    fn test_scrape_url() {
        let url = Url::parse("http://tracker.test:6969/announce").unwrap();
        assert_eq!(SwarmDiscovery::scrape_url(&url).unwrap().as_str(), "http://tracker.test:6969/scrape");
        let url = Url::parse("http://tracker.test/x/announce.php?key=1").unwrap();
        assert_eq!(SwarmDiscovery::scrape_url(&url).unwrap().as_str(), "http://tracker.test/x/scrape.php?key=1");
        let url = Url::parse("http://tracker.test/a").unwrap();
        assert!(SwarmDiscovery::scrape_url(&url).is_none());
    }
}

use std::{collections::HashSet, time::Instant};
use rand::{rngs::StdRng, Rng};
use slotmap::SecondaryMap;
use crate::{
    client::{Core, Timer},
    config::ChokeMetric,
    event::SwarmEvent,
    p2p::{PeerConnection, PeerKey},
    time::TimerId,
};

// Peers connected this recently are favoured for the optimistic unchoke.
const NEW_PEER_ROUNDS: u32 = 3;
const NEW_PEER_WEIGHT: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct ChokePeer {
    joined: Instant,
}

// Hands out upload slots. Every round the best peers by the configured rate
// metric are unchoked, plus one rotating optimistic unchoke.
#[derive(Debug, Default)]
pub(crate) struct ChokeScheduler {

    // Peers that announced their pieces.
    peers: SecondaryMap<PeerKey, ChokePeer>,

    optimistic: Option<PeerKey>,

    // Periodic rounds run so far.
    round: u64,

    early_run: Option<TimerId>,

}

struct Candidate {
    key: PeerKey,
    score: f64,
    interested: bool,
    unchoked: bool,
}

impl ChokeScheduler {

    pub fn handle(&mut self, core: &mut Core, event: &SwarmEvent) {
        match event {

            SwarmEvent::BitfieldReceived { peer, .. } => {
                self.peers.insert(*peer, ChokePeer { joined: core.now });
            },

            SwarmEvent::PeerInterested { peer } | SwarmEvent::PeerNotInterested { peer } => {
                if !self.peers.contains_key(*peer) {
                    return;
                }
                let unchoked = core.peers.get(*peer).map(|p| !p.state.am_choking).unwrap_or(false);
                if unchoked || self.num_regular(core) < core.config.max_unchoked_peers {
                    self.schedule_early_run(core);
                }
            },

            SwarmEvent::PeerDisconnected { peer, .. } => {
                if self.peers.remove(*peer).is_none() {
                    return;
                }
                let was_optimistic = self.optimistic == Some(*peer);
                if was_optimistic {
                    self.optimistic = None;
                }
                let was_unchoked = core.peers.get(*peer).map(|p| !p.state.am_choking).unwrap_or(false);
                if was_unchoked && !was_optimistic {
                    self.schedule_early_run(core);
                }
            },

            _ => {},
        }
    }

    pub fn optimistic(&self) -> Option<PeerKey> {
        self.optimistic
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_tracked(&self, peer: PeerKey) -> bool {
        self.peers.contains_key(peer)
    }

    // Unchoked peers not counting the optimistic one.
    pub fn num_regular(&self, core: &Core) -> usize {
        self.peers
            .keys()
            .filter(|k| Some(*k) != self.optimistic)
            .filter_map(|k| core.peers.get(k))
            .filter(|p| p.is_connected() && !p.state.am_choking)
            .count()
    }

    fn schedule_early_run(&mut self, core: &mut Core) {
        if self.early_run.is_none() {
            tracing::trace!("scheduling early choke round");
            self.early_run = Some(core.timers.schedule(core.now, Timer::EarlyChoke));
        }
    }

    pub fn on_early_run(&mut self, core: &mut Core) {
        self.early_run = None;
        self.run_round(core, false);
    }

    fn score(metric: ChokeMetric, seeding: bool, peer: &PeerConnection) -> f64 {
        match metric {
            ChokeMetric::Auto if seeding => peer.throughput.up.rate(),
            ChokeMetric::Auto | ChokeMetric::DownloadRate => peer.throughput.down.rate(),
            ChokeMetric::UploadRate => peer.throughput.up.rate(),
        }
    }

    pub fn run_round(&mut self, core: &mut Core, periodic: bool) {

        if periodic {
            self.round += 1;
        }
        let max = core.config.max_unchoked_peers;
        let metric = core.config.choke_metric;

        // Drop peers that went away without us noticing.
        let stale: Vec<PeerKey> = self.peers
            .keys()
            .filter(|k| !core.peers.get(*k).map(|p| p.is_connected()).unwrap_or(false))
            .collect();
        for key in stale {
            self.peers.remove(key);
        }
        if let Some(opt) = self.optimistic {
            if !self.peers.contains_key(opt) {
                self.optimistic = None;
            }
        }

        // Everyone starts out choked, classified by their last known interest.
        let mut candidates: Vec<Candidate> = self.peers
            .keys()
            .filter_map(|key| core.peers.get(key).map(|p| Candidate {
                key,
                score: Self::score(metric, core.seeding, p),
                interested: p.state.peer_interested,
                unchoked: !p.state.am_choking,
            }))
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let reconsider = self.optimistic.is_none()
            || (periodic && self.round % core.config.optimistic_multiple.max(1) as u64 == 0);

        // Best interested peers, the current optimistic one is only kept out
        // of the running while it keeps its slot.
        let top: Vec<PeerKey> = candidates
            .iter()
            .filter(|c| c.interested)
            .filter(|c| reconsider || Some(c.key) != self.optimistic)
            .take(max)
            .map(|c| c.key)
            .collect();

        // Already unchoked peers in the top set keep their slot, the worst of
        // the rest are displaced by newcomers.
        let mut regular: HashSet<PeerKey> = candidates
            .iter()
            .filter(|c| c.unchoked && top.contains(&c.key))
            .map(|c| c.key)
            .collect();
        let displaced: Vec<PeerKey> = candidates
            .iter()
            .rev()
            .filter(|c| c.unchoked && !regular.contains(&c.key) && Some(c.key) != self.optimistic)
            .map(|c| c.key)
            .collect();
        for key in top.iter() {
            if regular.len() >= max {
                break;
            }
            regular.insert(*key);
        }

        // Uninterested peers doing better than the worst peer unchoked going
        // into this round are unchoked on top of the regular slots, they'll be
        // served once they ask.
        let worst = candidates
            .iter()
            .filter(|c| c.unchoked)
            .map(|c| c.score)
            .fold(f64::INFINITY, f64::min);
        let rewarded: HashSet<PeerKey> = candidates
            .iter()
            .filter(|c| !c.interested && !regular.contains(&c.key) && c.score > worst)
            .take(max)
            .map(|c| c.key)
            .collect();
        regular.extend(rewarded.iter().copied());

        if self.optimistic.map(|o| regular.contains(&o)).unwrap_or(false) {
            // Promoted on merit, its optimistic slot is free again.
            self.optimistic = None;
        }
        if reconsider || self.optimistic.is_none() {
            let pool: Vec<(PeerKey, u32)> = candidates
                .iter()
                .filter(|c| c.interested && !regular.contains(&c.key))
                .map(|c| {
                    let recent = self.peers
                        .get(c.key)
                        .map(|p| core.now.saturating_duration_since(p.joined) < core.config.choke_interval * NEW_PEER_ROUNDS)
                        .unwrap_or(false);
                    (c.key, if recent { NEW_PEER_WEIGHT } else { 1 })
                })
                .collect();
            self.optimistic = weighted_pick(&pool, &mut core.rng);
        }

        // Only peers whose state changes see a message.
        let mut changed = 0;
        for c in candidates.iter() {
            let unchoke = regular.contains(&c.key) || self.optimistic == Some(c.key);
            if let Some(p) = core.peers.get_mut(c.key) {
                if p.set_choking(!unchoke) {
                    changed += 1;
                }
            }
        }

        tracing::debug!(
            "choke round {} ({}): {} unchoked, {} rewarded, optimistic {:?}, {} displaced, {} changed",
            self.round,
            if periodic { "periodic" } else { "early" },
            regular.len() - rewarded.len(),
            rewarded.len(),
            self.optimistic,
            displaced.iter().filter(|k| !regular.contains(*k)).count(),
            changed,
        );
    }
}

// Random choice where each candidate counts as many times as its weight.
fn weighted_pick(pool: &[(PeerKey, u32)], rng: &mut StdRng) -> Option<PeerKey> {
    let total: u32 = pool.iter().map(|(_, w)| *w).sum();
    if total == 0 {
        return None;
    }
    let mut ticket = rng.gen_range(0..total);
    for (key, weight) in pool {
        if ticket < *weight {
            return Some(*key);
        }
        ticket -= weight;
    }
    None
}

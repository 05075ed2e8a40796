use std::collections::BTreeSet;
use crate::{
    block::{num_blocks, BlockData, BlockInfo},
    client::{Core, Timer},
    config::Config,
    event::SwarmEvent,
    info::TorrentDescriptor,
    p2p::PeerKey,
    Bitfield,
};

mod book;
mod policy;
mod rarity;

pub use book::RequestId;
pub(crate) use book::{BlockRequest, RequestBook, RequestCaps};
pub(crate) use policy::{BlockSelector, Policy};
pub(crate) use rarity::Rarity;

// Decides which block to request next from which peer and keeps the request
// book consistent with completions, timeouts, chokes and disconnects.
pub(crate) struct RequestScheduler {

    book: RequestBook,

    policy: Policy,

    block_size: usize,

}

impl RequestScheduler {

    pub fn new(descriptor: &TorrentDescriptor, have: &Bitfield, config: &Config) -> Self {
        let book = RequestBook::new(descriptor, have, config.request_block_size);
        let policy = Policy::new(
            config.selection_policy,
            descriptor.num_pieces,
            book.needed.keys().copied(),
        );
        Self {
            book,
            policy,
            block_size: config.request_block_size,
        }
    }

    pub fn handle(&mut self, core: &mut Core, event: &SwarmEvent) {
        match event {

            SwarmEvent::BitfieldReceived { peer, bitfield } => {
                self.policy.peer_joined(bitfield);
                self.update_interest(core, *peer);
                self.fill(core, *peer);
            },

            SwarmEvent::Have { peer, piece } => {
                self.policy.peer_has(*piece);
                if self.is_needed(*piece) {
                    self.update_interest(core, *peer);
                    self.fill(core, *peer);
                }
            },

            // Requests are discarded by a choking peer.
            SwarmEvent::PeerChoked { peer } => self.drop_peer_requests(core, *peer),

            SwarmEvent::PeerUnchoked { peer } => self.fill(core, *peer),

            SwarmEvent::BlockReceived { peer, block } => self.on_block(core, *peer, block),

            SwarmEvent::PeerDisconnected { peer, .. } => {
                if let Some(p) = core.peers.get(*peer) {
                    if p.introduced {
                        self.policy.peer_left(&p.bitfield);
                    }
                }
                self.drop_peer_requests(core, *peer);
                self.fill_all(core);
            },

            _ => {},
        }
    }

    pub fn is_needed(&self, piece: usize) -> bool {
        self.book.needed.contains_key(&piece)
    }

    pub fn num_needed(&self) -> usize {
        self.book.needed.len()
    }

    // Needed pieces with at least one request in flight.
    pub fn num_pending(&self) -> usize {
        self.book.needed.values().filter(|p| !p.pending.is_empty()).count()
    }

    pub fn outstanding(&self, peer: PeerKey) -> usize {
        self.book.outstanding(peer)
    }

    pub fn book(&self) -> &RequestBook {
        &self.book
    }

    pub fn rarity(&self) -> Option<&Rarity> {
        self.policy.rarity()
    }

    // Interested exactly when the peer has a piece we need.
    pub fn update_interest(&mut self, core: &mut Core, peer: PeerKey) {
        let Some(p) = core.peers.get_mut(peer) else { return };
        if !p.is_connected() {
            return;
        }
        let wanted = self.book.needed.keys().any(|idx| p.has_piece(*idx));
        if p.set_interested(wanted) {
            tracing::debug!("interested in {}: {}", p.address, wanted);
        }
    }

    // Requests blocks from the peer until a cap or the policy says stop.
    pub fn fill(&mut self, core: &mut Core, peer: PeerKey) {
        let caps = RequestCaps::from(&core.config);
        loop {
            let Some(p) = core.peers.get(peer) else { return };
            if !p.is_connected() || !p.introduced || p.state.peer_choking || !p.state.am_interested {
                return;
            }
            if self.book.outstanding(peer) >= caps.per_peer {
                return;
            }
            let Some(block) = self.policy.select(&self.book, caps, peer, &p.bitfield, &mut core.rng) else {
                return;
            };
            self.issue(core, peer, block);
        }
    }

    pub fn fill_all(&mut self, core: &mut Core) {
        let peers: Vec<PeerKey> = core.peers.keys().collect();
        for peer in peers {
            self.fill(core, peer);
        }
    }

    fn issue(&mut self, core: &mut Core, peer: PeerKey, block: BlockInfo) {

        // Each block gets its share of the piece budget, stretched by how
        // many requests the peer already has to answer first.
        let outstanding = self.book.outstanding(peer) as u32;
        let blocks_per_piece = num_blocks(core.descriptor.piece_len(block.piece_idx), self.block_size).max(1) as u32;
        let timeout = core.config.piece_timeout / blocks_per_piece * (1 + outstanding);

        let Some(id) = self.book.insert(peer, block) else { return };
        let timer = core.timers.schedule_in(core.now, timeout, Timer::BlockTimeout(id));
        if let Some(request) = self.book.get_mut(id) {
            request.timeout = Some(timer);
        }

        if let Some(p) = core.peers.get_mut(peer) {
            tracing::trace!("requesting {:?} from {}, timeout {:?}", block, p.address, timeout);
            p.request_piece(block);
        }
    }

    // Removes a request and cancels its timer.
    fn release(&mut self, core: &mut Core, id: RequestId) -> Option<BlockRequest> {
        let request = self.book.remove(id)?;
        if let Some(timer) = request.timeout {
            core.timers.cancel(timer);
        }
        Some(request)
    }

    fn drop_peer_requests(&mut self, core: &mut Core, peer: PeerKey) {
        let mut pieces = BTreeSet::new();
        for id in self.book.peer_requests(peer) {
            if let Some(request) = self.release(core, id) {
                pieces.insert(request.block.piece_idx);
            }
        }
        for piece in pieces {
            self.piece_cancelled_if_idle(core, piece);
        }
    }

    fn piece_cancelled_if_idle(&mut self, core: &mut Core, piece: usize) {
        if self.book.needed.get(&piece).map(|p| p.pending.is_empty()).unwrap_or(false) {
            tracing::debug!("no requests left for piece {}", piece);
            core.out.event(SwarmEvent::PieceCancelled { piece });
        }
    }

    pub fn on_block_timeout(&mut self, core: &mut Core, id: RequestId) {
        // The timer already fired, nothing to cancel.
        let Some(request) = self.book.remove(id) else { return };

        if let Some(p) = core.peers.get_mut(request.peer) {
            tracing::debug!("request for {:?} to {} timed out", request.block, p.address);
            p.cancel_request(request.block);
        }
        core.out.event(SwarmEvent::PieceTimeout { peer: request.peer, block: request.block });
        self.piece_cancelled_if_idle(core, request.block.piece_idx);
    }

    fn on_block(&mut self, core: &mut Core, peer: PeerKey, data: &BlockData) {

        let info = data.info();
        let Some(id) = self.book.find(peer, &info) else {
            tracing::warn!("unexpected block: {:?}", info);
            return;
        };
        self.release(core, id);

        if !core.store.write_block(&info, &data.data) {
            tracing::warn!("could not store block: {:?}", info);
            return;
        }
        core.downloaded += info.len as u64;

        if let Some(piece) = self.book.needed.get_mut(&info.piece_idx) {
            piece.possible.retain(|b| *b != info);
            piece.contributors.insert(peer);
        }

        // Anyone else still fetching this block is wasting bandwidth.
        for dup in self.book.duplicates(&info) {
            if let Some(request) = self.release(core, dup) {
                if let Some(p) = core.peers.get_mut(request.peer) {
                    p.cancel_request(info);
                }
            }
        }
        core.out.event(SwarmEvent::BlockComplete { peer, block: info });

        let received = self.book.needed
            .get(&info.piece_idx)
            .map(|p| p.is_received())
            .unwrap_or(false);
        if received {
            self.finish_piece(core, info.piece_idx);
        }

        self.fill(core, peer);
    }

    fn finish_piece(&mut self, core: &mut Core, idx: usize) {

        let valid = !core.config.check_downloaded_data || core.store.verify_piece(idx);
        if !valid {
            tracing::warn!("piece {} failed hash check", idx);
            let piece_len = core.descriptor.piece_len(idx);
            if let Some(piece) = self.book.needed.get_mut(&idx) {
                for contributor in piece.contributors.iter() {
                    if let Some(p) = core.peers.get_mut(*contributor) {
                        *p.corrupt_pieces.entry(idx).or_default() += 1;
                    }
                }
                piece.reset_blocks(piece_len, self.block_size);
            }
            core.out.event(SwarmEvent::PieceCorrupt { piece: idx });
            return;
        }

        self.book.needed.remove(&idx);
        core.bitfield.set(idx, true);
        self.policy.piece_completed(idx);

        for p in core.peers.values_mut().filter(|p| p.is_connected()) {
            p.send_have(idx);
        }
        tracing::info!(
            "piece {} complete, {}/{} pieces",
            idx,
            core.bitfield.count_ones(),
            core.descriptor.num_pieces,
        );
        core.out.event(SwarmEvent::PieceComplete { piece: idx });

        if self.book.needed.is_empty() {
            tracing::info!("download complete, seeding");
            core.seeding = true;
            core.out.event(SwarmEvent::DownloadComplete);
            for p in core.peers.values_mut() {
                p.set_interested(false);
            }
        } else {
            let peers: Vec<PeerKey> = core.peers.keys().collect();
            for peer in peers {
                self.update_interest(core, peer);
            }
        }
    }

    // Block boundaries change, so nothing in flight can be matched anymore.
    pub fn set_block_size(&mut self, core: &mut Core, size: usize) {
        if size == self.block_size {
            return;
        }
        tracing::info!("request block size {} -> {}, dropping {} requests", self.block_size, size, self.book.len());

        for id in self.book.all_requests() {
            if let Some(request) = self.release(core, id) {
                if let Some(p) = core.peers.get_mut(request.peer) {
                    p.cancel_request(request.block);
                }
            }
        }
        self.block_size = size;
        for piece in self.book.needed.values_mut() {
            piece.reset_blocks(core.descriptor.piece_len(piece.idx), size);
        }
        self.fill_all(core);
    }
}

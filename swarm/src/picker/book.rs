use std::collections::{BTreeMap, HashMap, HashSet};
use slotmap::{SecondaryMap, SlotMap};
use crate::{
    block::{piece_blocks, BlockInfo},
    config::Config,
    info::TorrentDescriptor,
    p2p::PeerKey,
    time::TimerId,
    Bitfield,
};

slotmap::new_key_type! {
    // Stable handle of an in-flight block request.
    pub struct RequestId;
}

#[derive(Debug, Clone)]
pub struct BlockRequest {

    pub block: BlockInfo,

    pub peer: PeerKey,

    pub timeout: Option<TimerId>,

}

// A piece we don't have yet.
#[derive(Debug)]
pub struct NeededPiece {

    pub idx: usize,

    // Blocks not yet received, requested or not.
    pub possible: Vec<BlockInfo>,

    // Requests in flight for blocks of this piece.
    pub pending: Vec<RequestId>,

    // Requests in flight per peer.
    pub peers: HashMap<PeerKey, usize>,

    // Peers that delivered blocks of the current attempt.
    pub contributors: HashSet<PeerKey>,

}

impl NeededPiece {

    pub fn new(idx: usize, piece_len: usize, block_size: usize) -> Self {
        Self {
            idx,
            possible: piece_blocks(idx, piece_len, block_size),
            pending: Vec::new(),
            peers: HashMap::new(),
            contributors: HashSet::new(),
        }
    }

    // Starts the piece over, used after a failed hash check or a block size change.
    pub fn reset_blocks(&mut self, piece_len: usize, block_size: usize) {
        self.possible = piece_blocks(self.idx, piece_len, block_size);
        self.contributors.clear();
    }

    pub fn is_received(&self) -> bool {
        self.possible.is_empty()
    }
}

// Concurrency limits checked before every request.
#[derive(Debug, Clone, Copy)]
pub struct RequestCaps {
    pub per_peer: usize,
    pub per_piece: usize,
    pub per_block: usize,
    pub per_peer_per_piece: usize,
}

impl From<&Config> for RequestCaps {
    fn from(config: &Config) -> Self {
        Self {
            per_peer: config.max_requests_per_peer,
            per_piece: config.max_requests_per_piece,
            per_block: config.max_requests_per_block,
            per_peer_per_piece: config.max_requests_per_peer_per_piece,
        }
    }
}

// Needed pieces and every request in flight. Each request lives once in the
// arena and is referenced by id from its piece and from its peer, so removal
// through either index leaves neither dangling.
#[derive(Debug, Default)]
pub struct RequestBook {

    pub needed: BTreeMap<usize, NeededPiece>,

    requests: SlotMap<RequestId, BlockRequest>,

    by_peer: SecondaryMap<PeerKey, Vec<RequestId>>,

}

impl RequestBook {

    pub fn new(descriptor: &TorrentDescriptor, have: &Bitfield, block_size: usize) -> Self {
        let needed = (0..descriptor.num_pieces)
            .filter(|idx| !have[*idx])
            .map(|idx| (idx, NeededPiece::new(idx, descriptor.piece_len(idx), block_size)))
            .collect();
        Self {
            needed,
            ..Default::default()
        }
    }

    pub fn get(&self, id: RequestId) -> Option<&BlockRequest> {
        self.requests.get(id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut BlockRequest> {
        self.requests.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn outstanding(&self, peer: PeerKey) -> usize {
        self.by_peer.get(peer).map(Vec::len).unwrap_or(0)
    }

    pub fn peer_requests(&self, peer: PeerKey) -> Vec<RequestId> {
        self.by_peer.get(peer).cloned().unwrap_or_default()
    }

    pub fn all_requests(&self) -> Vec<RequestId> {
        self.requests.keys().collect()
    }

    // Requests in flight for exactly this block.
    pub fn duplicates(&self, block: &BlockInfo) -> Vec<RequestId> {
        match self.needed.get(&block.piece_idx) {
            Some(piece) => piece.pending
                .iter()
                .copied()
                .filter(|id| self.requests.get(*id).map(|r| r.block == *block).unwrap_or(false))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn find(&self, peer: PeerKey, block: &BlockInfo) -> Option<RequestId> {
        self.by_peer.get(peer)?
            .iter()
            .copied()
            .find(|id| self.requests.get(*id).map(|r| r.block == *block).unwrap_or(false))
    }

    pub fn request_allowed(&self, caps: RequestCaps, piece: &NeededPiece, peer: PeerKey, block: &BlockInfo) -> bool {

        if !piece.possible.contains(block) {
            return false;
        }
        if piece.pending.len() >= caps.per_piece {
            return false;
        }
        if self.outstanding(peer) >= caps.per_peer {
            return false;
        }
        if piece.peers.get(&peer).copied().unwrap_or(0) >= caps.per_peer_per_piece {
            return false;
        }

        let mut requesters = 0;
        for id in piece.pending.iter() {
            if let Some(request) = self.requests.get(*id) {
                if request.block == *block {
                    // Never ask the same peer for the same block twice.
                    if request.peer == peer {
                        return false;
                    }
                    requesters += 1;
                }
            }
        }
        requesters < caps.per_block
    }

    // Records a request, the piece must be needed.
    pub fn insert(&mut self, peer: PeerKey, block: BlockInfo) -> Option<RequestId> {
        let piece = self.needed.get_mut(&block.piece_idx)?;
        let id = self.requests.insert(BlockRequest { block, peer, timeout: None });
        piece.pending.push(id);
        *piece.peers.entry(peer).or_default() += 1;
        if let Some(entry) = self.by_peer.entry(peer) {
            entry.or_default().push(id);
        }
        Some(id)
    }

    // Drops a request from the arena and both indices.
    pub fn remove(&mut self, id: RequestId) -> Option<BlockRequest> {
        let request = self.requests.remove(id)?;

        if let Some(piece) = self.needed.get_mut(&request.block.piece_idx) {
            piece.pending.retain(|p| *p != id);
            if let Some(count) = piece.peers.get_mut(&request.peer) {
                *count -= 1;
                if *count == 0 {
                    piece.peers.remove(&request.peer);
                }
            }
        }

        if let Some(list) = self.by_peer.get_mut(request.peer) {
            list.retain(|p| *p != id);
            if list.is_empty() {
                self.by_peer.remove(request.peer);
            }
        }

        Some(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::MetaInfo, BLOCK_SIZE};

    fn setup() -> (RequestBook, Vec<PeerKey>) {
        let data = vec![1u8; 4 * 32_768];
        let descriptor = TorrentDescriptor::new(&MetaInfo::from_data("book.bin", &data, 32_768, None));
        let book = RequestBook::new(&descriptor, &Bitfield::repeat(false, 4), BLOCK_SIZE);
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let peers = (0..3).map(|_| keys.insert(())).collect();
        (book, peers)
    }

    fn caps(per_block: usize) -> RequestCaps {
        RequestCaps { per_peer: 10, per_piece: 16, per_block, per_peer_per_piece: 4 }
    }

    #[test]
    fn test_per_block_cap() {
        let (mut book, peers) = setup();
        let block = BlockInfo { piece_idx: 2, offset: 0, len: BLOCK_SIZE };
        let caps = caps(2);

        assert!(book.request_allowed(caps, &book.needed[&2], peers[0], &block));
        book.insert(peers[0], block).unwrap();
        // Same peer twice is never allowed.
        assert!(!book.request_allowed(caps, &book.needed[&2], peers[0], &block));
        assert!(book.request_allowed(caps, &book.needed[&2], peers[1], &block));
        book.insert(peers[1], block).unwrap();
        assert!(!book.request_allowed(caps, &book.needed[&2], peers[2], &block));
        assert_eq!(book.duplicates(&block).len(), 2);
    }

    #[test]
    fn test_per_peer_caps() {
        let (mut book, peers) = setup();
        let caps = RequestCaps { per_peer: 3, per_piece: 16, per_block: 1, per_peer_per_piece: 1 };
        let first = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE };
        let second = BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE };

        book.insert(peers[0], first).unwrap();
        // One request per piece for this peer.
        assert!(!book.request_allowed(caps, &book.needed[&0], peers[0], &second));

        book.insert(peers[0], BlockInfo { piece_idx: 1, offset: 0, len: BLOCK_SIZE }).unwrap();
        book.insert(peers[0], BlockInfo { piece_idx: 2, offset: 0, len: BLOCK_SIZE }).unwrap();
        assert_eq!(book.outstanding(peers[0]), 3);
        let other = BlockInfo { piece_idx: 3, offset: 0, len: BLOCK_SIZE };
        assert!(!book.request_allowed(caps, &book.needed[&3], peers[0], &other));
        assert!(book.request_allowed(caps, &book.needed[&3], peers[1], &other));
    }

    #[test]
    fn test_remove_clears_both_indices() {
        let (mut book, peers) = setup();
        let block = BlockInfo { piece_idx: 1, offset: BLOCK_SIZE, len: BLOCK_SIZE };
        let id = book.insert(peers[0], block).unwrap();
        assert_eq!(book.find(peers[0], &block), Some(id));

        let removed = book.remove(id).unwrap();
        assert_eq!(removed.block, block);
        assert!(book.remove(id).is_none());
        assert_eq!(book.outstanding(peers[0]), 0);
        assert!(book.needed[&1].pending.is_empty());
        assert!(book.needed[&1].peers.is_empty());
        assert!(book.find(peers[0], &block).is_none());
        assert_eq!(book.len(), 0);
    }

    #[test]
    fn test_received_block_not_requestable() {
        let (mut book, peers) = setup();
        let block = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE };
        book.needed.get_mut(&0).unwrap().possible.retain(|b| *b != block);
        assert!(!book.request_allowed(caps(1), &book.needed[&0], peers[0], &block));
        assert!(book.insert(peers[0], BlockInfo { piece_idx: 9, offset: 0, len: 1 }).is_none());
    }
}

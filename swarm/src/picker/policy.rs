use rand::{rngs::StdRng, seq::SliceRandom};
use crate::{block::BlockInfo, config::SelectionPolicy, p2p::PeerKey, Bitfield};
use super::{book::{RequestBook, RequestCaps}, rarity::Rarity};

// Chooses the next block to request from a peer. Implementations keep
// whatever piece availability they need through the hooks.
pub(crate) trait BlockSelector {

    fn peer_joined(&mut self, _bitfield: &Bitfield) {}

    fn peer_left(&mut self, _bitfield: &Bitfield) {}

    fn peer_has(&mut self, _piece: usize) {}

    fn piece_completed(&mut self, _piece: usize) {}

    fn select(
        &self,
        book: &RequestBook,
        caps: RequestCaps,
        peer: PeerKey,
        has: &Bitfield,
        rng: &mut StdRng,
    ) -> Option<BlockInfo>;

}

// First allowed block in piece index order.
#[derive(Debug, Default)]
pub(crate) struct Sequential;

impl BlockSelector for Sequential {
    fn select(
        &self,
        book: &RequestBook,
        caps: RequestCaps,
        peer: PeerKey,
        has: &Bitfield,
        _rng: &mut StdRng,
    ) -> Option<BlockInfo> {
        book.needed
            .values()
            .filter(|piece| has[piece.idx])
            .find_map(|piece| {
                piece.possible
                    .iter()
                    .find(|block| book.request_allowed(caps, piece, peer, block))
                    .copied()
            })
    }
}

#[derive(Debug)]
pub(crate) struct RarestFirst {
    pub rarity: Rarity,
}

impl RarestFirst {
    pub fn new(num_pieces: usize, needed: impl IntoIterator<Item = usize>) -> Self {
        Self { rarity: Rarity::new(num_pieces, needed) }
    }
}

impl BlockSelector for RarestFirst {

    fn peer_joined(&mut self, bitfield: &Bitfield) {
        bitfield.iter_ones().for_each(|idx| self.rarity.increment(idx));
    }

    fn peer_left(&mut self, bitfield: &Bitfield) {
        bitfield.iter_ones().for_each(|idx| self.rarity.decrement(idx));
    }

    fn peer_has(&mut self, piece: usize) {
        self.rarity.increment(piece);
    }

    fn piece_completed(&mut self, piece: usize) {
        self.rarity.remove(piece);
    }

    fn select(
        &self,
        book: &RequestBook,
        caps: RequestCaps,
        peer: PeerKey,
        has: &Bitfield,
        rng: &mut StdRng,
    ) -> Option<BlockInfo> {

        // Finish what this peer is already helping with.
        let guess = book.needed
            .values()
            .filter(|piece| piece.peers.contains_key(&peer))
            .find_map(|piece| {
                piece.possible
                    .iter()
                    .find(|block| book.request_allowed(caps, piece, peer, block))
                    .copied()
            });
        if guess.is_some() {
            return guess;
        }

        for bucket in self.rarity.available() {
            let candidates: Vec<BlockInfo> = bucket
                .iter()
                .filter(|idx| has[**idx])
                .filter_map(|idx| book.needed.get(idx))
                .flat_map(|piece| {
                    piece.possible
                        .iter()
                        .filter(move |block| book.request_allowed(caps, piece, peer, block))
                        .copied()
                })
                .collect();
            if let Some(block) = candidates.choose(rng) {
                return Some(*block);
            }
        }
        None
    }
}

// Closed set of selection strategies, picked from the config.
#[derive(Debug)]
pub(crate) enum Policy {
    Sequential(Sequential),
    RarestFirst(RarestFirst),
}

impl Policy {

    pub fn new(kind: SelectionPolicy, num_pieces: usize, needed: impl IntoIterator<Item = usize>) -> Self {
        match kind {
            SelectionPolicy::Sequential => Policy::Sequential(Sequential),
            SelectionPolicy::RarestFirst => Policy::RarestFirst(RarestFirst::new(num_pieces, needed)),
        }
    }

    pub fn rarity(&self) -> Option<&Rarity> {
        match self {
            Policy::RarestFirst(p) => Some(&p.rarity),
            Policy::Sequential(_) => None,
        }
    }

    fn inner(&self) -> &dyn BlockSelector {
        match self {
            Policy::Sequential(p) => p,
            Policy::RarestFirst(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn BlockSelector {
        match self {
            Policy::Sequential(p) => p,
            Policy::RarestFirst(p) => p,
        }
    }
}

impl BlockSelector for Policy {

    fn peer_joined(&mut self, bitfield: &Bitfield) {
        self.inner_mut().peer_joined(bitfield)
    }

    fn peer_left(&mut self, bitfield: &Bitfield) {
        self.inner_mut().peer_left(bitfield)
    }

    fn peer_has(&mut self, piece: usize) {
        self.inner_mut().peer_has(piece)
    }

    fn piece_completed(&mut self, piece: usize) {
        self.inner_mut().piece_completed(piece)
    }

    fn select(
        &self,
        book: &RequestBook,
        caps: RequestCaps,
        peer: PeerKey,
        has: &Bitfield,
        rng: &mut StdRng,
    ) -> Option<BlockInfo> {
        self.inner().select(book, caps, peer, has, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use slotmap::SlotMap;
    use crate::{info::TorrentDescriptor, metainfo::MetaInfo, BLOCK_SIZE};

    fn book() -> RequestBook {
        let data = vec![3u8; 6 * 32_768];
        let descriptor = TorrentDescriptor::new(&MetaInfo::from_data("policy.bin", &data, 32_768, None));
        RequestBook::new(&descriptor, &Bitfield::repeat(false, 6), BLOCK_SIZE)
    }

    fn caps() -> RequestCaps {
        RequestCaps { per_peer: 10, per_piece: 16, per_block: 1, per_peer_per_piece: 4 }
    }

    fn has(pieces: &[usize]) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, 6);
        pieces.iter().for_each(|i| bitfield.set(*i, true));
        bitfield
    }

    #[test]
    fn test_sequential_in_order() {
        let mut book = book();
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let peer = keys.insert(());
        let mut rng = StdRng::seed_from_u64(1);
        let has = has(&[2, 4]);

        let first = Sequential.select(&book, caps(), peer, &has, &mut rng).unwrap();
        assert_eq!(first, BlockInfo { piece_idx: 2, offset: 0, len: BLOCK_SIZE });
        book.insert(peer, first);
        let second = Sequential.select(&book, caps(), peer, &has, &mut rng).unwrap();
        assert_eq!(second, BlockInfo { piece_idx: 2, offset: BLOCK_SIZE, len: BLOCK_SIZE });
    }

    #[test]
    fn test_rarest_first_picks_rarest_bucket() {
        let book = book();
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let peer = keys.insert(());
        let mut rng = StdRng::seed_from_u64(7);

        let mut policy = RarestFirst::new(6, 0..6);
        policy.peer_joined(&has(&[0, 1, 2, 3]));
        policy.peer_joined(&has(&[0, 1, 3]));
        policy.peer_joined(&has(&[0, 3]));
        // Piece 2 is the rarest the peer has.
        for _ in 0..10 {
            let block = policy.select(&book, caps(), peer, &has(&[0, 1, 2, 3]), &mut rng).unwrap();
            assert_eq!(block.piece_idx, 2);
        }
    }

    #[test]
    fn test_rarest_first_educated_guess() {
        let mut book = book();
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let peer = keys.insert(());
        let mut rng = StdRng::seed_from_u64(3);

        let mut policy = RarestFirst::new(6, 0..6);
        policy.peer_joined(&has(&[0, 1, 5]));
        policy.peer_joined(&has(&[0, 1]));
        // Piece 0 is common but already in flight with this peer.
        book.insert(peer, BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE });

        let block = policy.select(&book, caps(), peer, &has(&[0, 1, 5]), &mut rng).unwrap();
        assert_eq!(block, BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE });
    }

    #[test]
    fn test_nothing_to_select() {
        let book = book();
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let peer = keys.insert(());
        let mut rng = StdRng::seed_from_u64(3);
        let policy = Policy::new(SelectionPolicy::RarestFirst, 6, 0..6);
        // Nobody announced anything.
        assert!(policy.select(&book, caps(), peer, &has(&[]), &mut rng).is_none());
        assert!(Sequential.select(&book, caps(), peer, &has(&[]), &mut rng).is_none());
    }
}

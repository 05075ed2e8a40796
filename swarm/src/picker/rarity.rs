use std::collections::BTreeSet;

/*
Pieces are bucketed by how many connected peers announce them, so the rarest
needed pieces are found by walking buckets from the bottom. Counts change by
one on every bitfield, have and disconnect, and a piece simply moves to the
neighbouring bucket.
*/
#[derive(Debug)]
pub struct Rarity {
    // Peers announcing each piece, idx aligned.
    counts: Vec<usize>,
    // Needed pieces by announcement count.
    buckets: Vec<BTreeSet<usize>>,
}

impl Rarity {

    pub fn new(num_pieces: usize, needed: impl IntoIterator<Item = usize>) -> Self {
        let mut zero = BTreeSet::new();
        zero.extend(needed);
        Self {
            counts: vec![0; num_pieces],
            buckets: vec![zero],
        }
    }

    pub fn increment(&mut self, idx: usize) {
        let Some(count) = self.counts.get_mut(idx) else { return };
        let old = *count;
        *count += 1;
        // Pieces we have are counted but not bucketed.
        if self.buckets.get_mut(old).map(|b| b.remove(&idx)).unwrap_or(false) {
            if self.buckets.len() <= old + 1 {
                self.buckets.push(BTreeSet::new());
            }
            self.buckets[old + 1].insert(idx);
        }
    }

    pub fn decrement(&mut self, idx: usize) {
        let Some(count) = self.counts.get_mut(idx) else { return };
        if *count == 0 {
            tracing::warn!("availability of piece {} dropped below zero", idx);
            return;
        }
        let old = *count;
        *count -= 1;
        if self.buckets.get_mut(old).map(|b| b.remove(&idx)).unwrap_or(false) {
            self.buckets[old - 1].insert(idx);
        }
    }

    // Piece no longer needed.
    pub fn remove(&mut self, idx: usize) {
        if let Some(bucket) = self.counts.get(idx).and_then(|c| self.buckets.get_mut(*c)) {
            bucket.remove(&idx);
        }
    }

    pub fn count(&self, idx: usize) -> usize {
        self.counts.get(idx).copied().unwrap_or(0)
    }

    // Bucket holding a needed piece.
    pub fn bucket_of(&self, idx: usize) -> Option<usize> {
        let count = *self.counts.get(idx)?;
        self.buckets.get(count)?.contains(&idx).then_some(count)
    }

    // Non-empty buckets of pieces at least one peer has, rarest first.
    pub fn available(&self) -> impl Iterator<Item = &BTreeSet<usize>> {
        self.buckets.iter().skip(1).filter(|b| !b.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_have_moves_one_piece() {
        let mut rarity = Rarity::new(8, 0..8);
        for idx in [1, 2, 5, 5, 6] {
            rarity.increment(idx);
        }
        let before: Vec<_> = (0..8).map(|i| rarity.bucket_of(i)).collect();
        assert_eq!(rarity.bucket_of(5), Some(2));

        rarity.increment(5);

        for idx in 0..8 {
            if idx == 5 {
                assert_eq!(rarity.bucket_of(idx), Some(3));
            } else {
                assert_eq!(rarity.bucket_of(idx), before[idx]);
            }
        }
    }

    #[test]
    fn test_completed_piece_leaves_buckets() {
        let mut rarity = Rarity::new(4, 0..4);
        rarity.increment(2);
        rarity.remove(2);
        assert_eq!(rarity.bucket_of(2), None);
        // Still counted, just not bucketed.
        rarity.increment(2);
        assert_eq!(rarity.count(2), 2);
        assert_eq!(rarity.bucket_of(2), None);
        rarity.decrement(2);
        assert_eq!(rarity.count(2), 1);
    }

    #[test]
    fn test_available_rarest_first() {
        let mut rarity = Rarity::new(4, [0, 1, 3]);
        rarity.increment(0);
        rarity.increment(0);
        rarity.increment(1);
        rarity.increment(2);
        let buckets: Vec<Vec<usize>> = rarity.available().map(|b| b.iter().copied().collect()).collect();
        assert_eq!(buckets, vec![vec![1], vec![0]]);
        rarity.decrement(1);
        rarity.decrement(1);
        assert_eq!(rarity.count(1), 0);
        assert_eq!(rarity.bucket_of(1), Some(0));
    }
}

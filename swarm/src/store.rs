use std::sync::Arc;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use crate::{block::BlockInfo, info::TorrentDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {

    #[error("data length {actual} does not match torrent length {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

}

type Result<T> = std::result::Result<T, StoreError>;

// In-memory buffer holding the whole shared file. Blocks are written at
// their absolute offset and pieces are verified in place.
pub struct PieceStore {

    descriptor: Arc<TorrentDescriptor>,

    data: Vec<u8>,

}

impl PieceStore {

    pub fn new_empty(descriptor: Arc<TorrentDescriptor>) -> Self {
        let data = vec![0; descriptor.total_len as usize];
        Self { descriptor, data }
    }

    pub fn from_data(descriptor: Arc<TorrentDescriptor>, data: Vec<u8>) -> Result<Self> {
        if data.len() as u64 != descriptor.total_len {
            return Err(StoreError::LengthMismatch {
                expected: descriptor.total_len,
                actual: data.len() as u64,
            });
        }
        Ok(Self { descriptor, data })
    }

    // Absolute byte range of a block, if it lies inside the torrent.
    fn range(&self, block: &BlockInfo) -> Option<std::ops::Range<usize>> {
        if !self.descriptor.is_valid_block(block) {
            return None;
        }
        let start = self.descriptor.piece_offset(block.piece_idx) + block.offset;
        Some(start..start + block.len)
    }

    pub fn read_block(&self, block: &BlockInfo) -> Option<Bytes> {
        self.range(block).map(|r| Bytes::copy_from_slice(&self.data[r]))
    }

    pub fn write_block(&mut self, block: &BlockInfo, data: &[u8]) -> bool {
        if data.len() != block.len {
            return false;
        }
        match self.range(block) {
            Some(r) => {
                self.data[r].copy_from_slice(data);
                true
            },
            None => false,
        }
    }

    pub fn piece(&self, idx: usize) -> &[u8] {
        let start = self.descriptor.piece_offset(idx);
        &self.data[start..start + self.descriptor.piece_len(idx)]
    }

    pub fn verify_piece(&self, idx: usize) -> bool {
        if idx >= self.descriptor.num_pieces {
            return false;
        }
        let hash: [u8; 20] = Sha1::digest(self.piece(idx)).into();
        hash == self.descriptor.piece_hashes[idx]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::MetaInfo;

    fn setup() -> (Arc<TorrentDescriptor>, Vec<u8>) {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let metainfo = MetaInfo::from_data("store.bin", &data, 16_384, None);
        (Arc::new(TorrentDescriptor::new(&metainfo)), data)
    }

    #[test]
    fn test_write_then_verify() {
        let (descriptor, data) = setup();
        let mut store = PieceStore::new_empty(descriptor.clone());
        assert!(!store.verify_piece(1));

        let block = BlockInfo { piece_idx: 1, offset: 0, len: 16_384 };
        assert!(store.write_block(&block, &data[16_384..32_768]));
        assert!(store.verify_piece(1));
        assert!(!store.verify_piece(0));
        assert_eq!(store.read_block(&block).unwrap(), &data[16_384..32_768]);
    }

    #[test]
    fn test_out_of_range_block() {
        let (descriptor, data) = setup();
        let mut store = PieceStore::from_data(descriptor, data).unwrap();
        // last piece is 50_000 - 3 * 16_384 = 848 bytes
        let block = BlockInfo { piece_idx: 3, offset: 0, len: 849 };
        assert!(store.read_block(&block).is_none());
        assert!(!store.write_block(&block, &[0; 849]));
        assert!(store.verify_piece(3));
        assert!(!store.verify_piece(4));
    }

    #[test]
    fn test_length_mismatch() {
        let (descriptor, _) = setup();
        assert!(matches!(
            PieceStore::from_data(descriptor, vec![0; 10]),
            Err(StoreError::LengthMismatch { expected: 50_000, actual: 10 })
        ));
    }
}

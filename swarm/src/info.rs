use url::Url;
use crate::{block::BlockInfo, metainfo::MetaInfo, ID};

// Immutable description of the shared file, parsed once and shared by the
// client, its schedulers and the tracker.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {

    pub name: String,

    pub info_hash: ID,

    pub total_len: u64,

    pub piece_len: usize,

    pub last_piece_len: usize,

    pub num_pieces: usize,

    pub piece_hashes: Vec<ID>,

    pub announce: Option<Url>,

}

impl TorrentDescriptor {

    pub fn new(metainfo: &MetaInfo) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;

        Self {
            name: metainfo.name().to_string(),
            info_hash: metainfo.info_hash(),
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            piece_hashes: metainfo.piece_hashes(),
            announce: metainfo.announce.clone(),
        }
    }

    // Returns length of piece given its index.
    pub fn piece_len(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> usize {
        idx * self.piece_len
    }

    // Whether the block lies inside an existing piece.
    pub fn is_valid_block(&self, block: &BlockInfo) -> bool {
        block.piece_idx < self.num_pieces && block.fits(self.piece_len(block.piece_idx))
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_lengths() {
        let data = vec![7u8; 70_000];
        let metainfo = MetaInfo::from_data("file.bin", &data, 32_768, None);
        let descriptor = TorrentDescriptor::new(&metainfo);
        assert_eq!(descriptor.num_pieces, 3);
        assert_eq!(descriptor.piece_len(0), 32_768);
        assert_eq!(descriptor.piece_len(2), 70_000 - 2 * 32_768);
        assert_eq!(descriptor.piece_offset(2), 65_536);
        assert!(descriptor.is_valid_block(&BlockInfo { piece_idx: 2, offset: 0, len: 4464 }));
        assert!(!descriptor.is_valid_block(&BlockInfo { piece_idx: 2, offset: 0, len: 4465 }));
        assert!(!descriptor.is_valid_block(&BlockInfo { piece_idx: 3, offset: 0, len: 1 }));
    }
}

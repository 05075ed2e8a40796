use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    // Index of piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of block within piece.
    pub offset: usize,

    // Data of block.
    pub data: Bytes,
}

impl BlockData {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {

    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    // Whether the block lies inside a piece of the given length.
    pub fn fits(&self, piece_len: usize) -> bool {
        self.len > 0 && self.end() <= piece_len
    }
}

pub fn block_len(piece_len: usize, block_size: usize, block_idx: usize) -> usize {
    block_size.min(piece_len - (block_idx * block_size))
}

pub fn num_blocks(piece_len: usize, block_size: usize) -> usize {
    (piece_len + (block_size - 1)) / block_size
}

// Splits a piece into consecutive blocks, the last may be short.
pub fn piece_blocks(piece_idx: usize, piece_len: usize, block_size: usize) -> Vec<BlockInfo> {
    (0..num_blocks(piece_len, block_size))
        .map(|i| BlockInfo {
            piece_idx,
            offset: i * block_size,
            len: block_len(piece_len, block_size, i),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        let normal_block_len = 16_384;
        let last_block_len = 8546;
        assert_eq!(block_len(normal_piece_len, BLOCK_SIZE, 0), normal_block_len);
        assert_eq!(block_len(normal_piece_len, BLOCK_SIZE, 1), normal_block_len);
        assert_eq!(block_len(last_piece_len, BLOCK_SIZE, 0), normal_block_len);
        assert_eq!(block_len(last_piece_len, BLOCK_SIZE, 1), last_block_len);
    }

    #[test]
    fn test_num_blocks() {
        (0..12).for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i, BLOCK_SIZE), i));
        assert_eq!(num_blocks(BLOCK_SIZE + 500, BLOCK_SIZE), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000, BLOCK_SIZE), 6);
        assert_eq!(num_blocks(0, BLOCK_SIZE), 0);
        assert_eq!(num_blocks(1000, 300), 4);
    }

    #[test]
    fn test_piece_blocks_cover_piece() {
        let blocks = piece_blocks(3, 40_000, BLOCK_SIZE);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], BlockInfo { piece_idx: 3, offset: 0, len: BLOCK_SIZE });
        assert_eq!(blocks[2], BlockInfo { piece_idx: 3, offset: 2 * BLOCK_SIZE, len: 40_000 - 2 * BLOCK_SIZE });
        assert_eq!(blocks.iter().map(|b| b.len).sum::<usize>(), 40_000);
    }

    #[test]
    fn test_block_fits() {
        let block = BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE };
        assert!(block.fits(2 * BLOCK_SIZE));
        assert!(!block.fits(2 * BLOCK_SIZE - 1));
        assert!(!BlockInfo { piece_idx: 0, offset: 0, len: 0 }.fits(10));
    }
}

/// Fixed block size for peer-wire requests (BEP-3 convention).
pub const BLOCK_SIZE: u32 = 16_384;

/// One verifiable unit of the torrent. A piece is fetched block by block,
/// reassembled, and checked against `checksum` before it may be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub index: u32,
    pub offset_in_file: u64,
    pub length: u32,
    pub checksum: [u8; 20],
    pub blocks: Vec<Block>,
}

/// A 16 KiB request window within a piece. Only the final block of a piece
/// may be shorter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
    pub offset: u32,
    pub length: u32,
}

impl Piece {
    /// Builds a piece and its block partition. Blocks cover exactly
    /// `[0, length)`: when `length` is a multiple of [`BLOCK_SIZE`] the last
    /// block is a full one, never zero-length.
    pub fn new(index: u32, offset_in_file: u64, length: u32, checksum: [u8; 20]) -> Self {
        debug_assert!(length > 0);
        let mut blocks = Vec::with_capacity(length.div_ceil(BLOCK_SIZE) as usize);
        let mut offset = 0;
        while offset < length {
            blocks.push(Block {
                offset,
                length: BLOCK_SIZE.min(length - offset),
            });
            offset += BLOCK_SIZE;
        }
        Self {
            index,
            offset_in_file,
            length,
            checksum,
            blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_partition_the_piece() {
        let piece = Piece::new(0, 0, 40_000, [0u8; 20]);
        assert_eq!(piece.blocks.len(), 3);
        assert_eq!(piece.blocks[0].length, BLOCK_SIZE);
        assert_eq!(piece.blocks[1].length, BLOCK_SIZE);
        assert_eq!(piece.blocks[2].length, 40_000 - 2 * BLOCK_SIZE);
        let covered: u32 = piece.blocks.iter().map(|b| b.length).sum();
        assert_eq!(covered, piece.length);
        for (i, block) in piece.blocks.iter().enumerate() {
            assert_eq!(block.offset, i as u32 * BLOCK_SIZE);
        }
    }

    #[test]
    fn exact_multiple_has_no_zero_length_tail() {
        let piece = Piece::new(2, 0, 2 * BLOCK_SIZE, [0u8; 20]);
        assert_eq!(piece.blocks.len(), 2);
        assert!(piece.blocks.iter().all(|b| b.length == BLOCK_SIZE));
    }

    #[test]
    fn short_piece_is_a_single_block() {
        let piece = Piece::new(3, 786_432, 68, [0u8; 20]);
        assert_eq!(piece.blocks.len(), 1);
        assert_eq!(piece.blocks[0].offset, 0);
        assert_eq!(piece.blocks[0].length, 68);
    }
}

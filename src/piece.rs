use sha1::{Digest, Sha1};

use crate::error::ApplicationError;
use crate::torrent::HASH_LEN;

/// Represents the current state of a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// The block has not been requested from any peer yet
    NotRequested,
    /// The block has been requested but not yet received
    Requested,
    /// The block has been received and stored in the piece buffer
    Downloaded,
}

/// Position of one block inside its piece
#[derive(Debug, Clone)]
pub struct BlockSpan {
    /// Offset (in bytes) from the start of the piece
    pub offset: u32,
    /// Length of the block in bytes
    pub length: u32,
    pub state:  BlockState,
}

/// A piece of the torrent file, composed of one or more blocks
#[derive(Debug, Clone)]
pub struct Piece {
    /// Index of the piece (0-based)
    pub index:  u32,
    /// Size of the piece in bytes
    pub length: u32,
    /// List of blocks that make up this piece
    pub blocks: Vec<BlockSpan>,
    pub verified: bool,
}

impl Piece {
    /// Lays out a piece of `length` bytes as `block_size` blocks, the last
    /// one holding the remainder.
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let blocks = (0..length)
            .step_by(block_size as usize)
            .map(|offset| BlockSpan {
                offset,
                length: block_size.min(length - offset),
                state:  BlockState::NotRequested,
            })
            .collect();

        Self { index, length, blocks, verified: false }
    }

    pub fn block_mut(&mut self, offset: u32) -> Option<&mut BlockSpan> {
        self.blocks.iter_mut().find(|b| b.offset == offset)
    }

    /// Puts every block back into the not-requested pool.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.state = BlockState::NotRequested;
        }
    }
}

/// A block requested from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index:  u32,
    pub begin:  u32,
    pub length: u32,
}

/// Block data received in a `piece` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data:  Vec<u8>,
}

impl Block {
    pub fn length(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Accumulates the blocks of one piece until it can be verified.
#[derive(Debug)]
pub struct PieceBuffer {
    index:      u32,
    block_size: u32,
    data:       Vec<u8>,
    filled:     Vec<bool>,
}

impl PieceBuffer {
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let blocks = length.div_ceil(block_size) as usize;
        Self {
            index,
            block_size,
            data: vec![0; length as usize],
            filled: vec![false; blocks],
        }
    }

    /// Copies `data` into place at `begin`. Returns false when the block does
    /// not line up with this buffer's layout; the buffer is left untouched.
    pub fn write(&mut self, begin: u32, data: &[u8]) -> bool {
        if begin % self.block_size != 0 {
            return false;
        }
        let slot = (begin / self.block_size) as usize;
        let start = begin as usize;
        let expected = (self.block_size as usize).min(self.data.len().saturating_sub(start));
        if slot >= self.filled.len() || data.len() != expected {
            return false;
        }
        self.data[start..start + data.len()].copy_from_slice(data);
        self.filled[slot] = true;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.filled.iter().all(|f| *f)
    }

    /// Checks the assembled bytes against `expected` and hands them over on a match.
    pub fn verify(self, expected: &[u8; HASH_LEN]) -> Result<Vec<u8>, ApplicationError> {
        let digest = Sha1::digest(&self.data);
        if digest.as_slice() == expected {
            Ok(self.data)
        } else {
            Err(ApplicationError::HashMismatch { index: self.index })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn digest(data: &[u8]) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&Sha1::digest(data));
        out
    }

    #[test]
    fn lays_out_short_final_block() {
        let piece = Piece::new(0, 39_768, 16_384);
        let sizes: Vec<_> = piece.blocks.iter().map(|b| (b.offset, b.length)).collect();
        assert_eq!(sizes, vec![(0, 16_384), (16_384, 16_384), (32_768, 7_000)]);
    }

    #[test]
    fn reassembles_in_any_order() {
        let data = content(39_768);
        let blocks = [(0u32, 16_384usize), (16_384, 16_384), (32_768, 7_000)];

        let mut forward = PieceBuffer::new(0, 39_768, 16_384);
        for (begin, len) in blocks {
            assert!(forward.write(begin, &data[begin as usize..begin as usize + len]));
        }

        let mut reverse = PieceBuffer::new(0, 39_768, 16_384);
        for (begin, len) in blocks.iter().rev() {
            assert!(!reverse.is_complete());
            assert!(reverse.write(*begin, &data[*begin as usize..*begin as usize + len]));
        }

        assert!(forward.is_complete() && reverse.is_complete());
        let expected = digest(&data);
        assert_eq!(forward.verify(&expected).unwrap(), data);
        assert_eq!(reverse.verify(&expected).unwrap(), data);
    }

    #[test]
    fn rejects_misaligned_or_wrong_sized_blocks() {
        let mut buf = PieceBuffer::new(0, 39_768, 16_384);
        assert!(!buf.write(100, &[0; 16_384]));
        assert!(!buf.write(32_768, &[0; 16_384]));
        assert!(!buf.write(49_152, &[0; 16]));
        assert!(!buf.write(0, &[0; 10]));
        assert!(!buf.is_complete());
    }

    #[test]
    fn detects_corruption() {
        let mut buf = PieceBuffer::new(5, 10, 16_384);
        assert!(buf.write(0, &[1; 10]));
        assert!(matches!(
            buf.verify(&digest(&[2; 10])),
            Err(ApplicationError::HashMismatch { index: 5 })
        ));
    }
}

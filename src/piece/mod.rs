pub mod active;
pub mod bitfield;
pub mod ranges;

use std::ops::Range;

pub use active::{ActivePiece, ActivePieceTracker, BlockOutcome};
pub use bitfield::{Bitfield, MissingIndices};

/// A block within a piece, the unit requested from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn from_range(piece_index: u32, range: Range<u32>) -> Self {
        Self {
            piece_index,
            offset: range.start,
            length: range.end - range.start,
        }
    }
}

use crate::error::PieceError;

/// One bit per piece, MSB first, as the wire format lays it out.
///
/// For the local torrent this is the only record of which pieces passed
/// hash verification. The same type also holds what a remote peer claims to
/// have, in which case nothing about it has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    pub fn new(piece_count: u32) -> Self {
        Bitfield {
            bits: vec![0; (piece_count as usize).div_ceil(8)],
            piece_count,
        }
    }

    /// Builds a bitfield from raw bytes, padding short input and masking
    /// spare trailing bits.
    pub fn from_bytes(bytes: &[u8], piece_count: u32) -> Self {
        let expected = (piece_count as usize).div_ceil(8);
        let mut bits = bytes.to_vec();
        bits.resize(expected, 0);

        let spare = expected * 8 - piece_count as usize;
        if spare > 0 {
            if let Some(last) = bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
        Bitfield { bits, piece_count }
    }

    pub fn full(piece_count: u32) -> Self {
        Self::from_bytes(&vec![0xFF; (piece_count as usize).div_ceil(8)], piece_count)
    }

    fn locate(&self, index: u32) -> Result<(usize, u8), PieceError> {
        if index >= self.piece_count {
            return Err(PieceError::OutOfRange {
                index,
                count: self.piece_count,
            });
        }
        let byte = (index / 8) as usize;
        let mask = 1u8 << (7 - (index % 8));
        Ok((byte, mask))
    }

    pub fn has(&self, index: u32) -> bool {
        match self.locate(index) {
            Ok((byte, mask)) => self.bits[byte] & mask != 0,
            Err(_) => false,
        }
    }

    /// Marks a piece as verified. Only the completion protocol calls this
    /// on the local bitfield.
    pub fn set_complete(&mut self, index: u32) -> Result<(), PieceError> {
        let (byte, mask) = self.locate(index)?;
        self.bits[byte] |= mask;
        Ok(())
    }

    /// Marks a piece as missing again. No other state is touched.
    pub fn clear(&mut self, index: u32) -> Result<(), PieceError> {
        let (byte, mask) = self.locate(index)?;
        self.bits[byte] &= !mask;
        Ok(())
    }

    /// Lenient setter for remote `Have` announcements; out of range indices
    /// are ignored.
    pub fn set_piece(&mut self, index: u32) {
        let _ = self.set_complete(index);
    }

    pub fn completed_count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn total_count(&self) -> u32 {
        self.piece_count
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.piece_count
    }

    /// Lazily walks the indices whose bit is clear. Call again (or clone the
    /// iterator) to restart.
    pub fn missing_indices(&self) -> MissingIndices<'_> {
        MissingIndices {
            bitfield: self,
            next: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[derive(Debug, Clone)]
pub struct MissingIndices<'a> {
    bitfield: &'a Bitfield,
    next: u32,
}

impl Iterator for MissingIndices<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while self.next < self.bitfield.piece_count {
            let index = self.next;
            self.next += 1;

            // Skip whole bytes that are already complete.
            if index % 8 == 0 && self.bitfield.bits[(index / 8) as usize] == 0xFF {
                self.next = index + 8;
                continue;
            }
            if !self.bitfield.has(index) {
                return Some(index);
            }
        }
        None
    }
}

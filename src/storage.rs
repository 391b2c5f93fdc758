use std::collections::HashMap;

use crate::error::StorageError;
use crate::torrent::TorrentMetadata;

/// Where verified and in-progress piece bytes live.
///
/// Disk layout and file mapping are the implementor's business; the engine
/// only writes blocks and reads whole pieces back for verification.
pub trait PieceStorage {
    fn write_block(
        &mut self,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError>;

    fn read_piece(&self, piece_index: u32) -> Result<Vec<u8>, StorageError>;
}

/// Keeps every piece in memory. Used by the loopback swarm and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    piece_lengths: Vec<u32>,
    pieces: HashMap<u32, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(meta: &impl TorrentMetadata) -> Self {
        Self {
            piece_lengths: (0..meta.piece_count()).map(|i| meta.piece_length(i)).collect(),
            pieces: HashMap::new(),
        }
    }

    /// Flips one byte of a stored piece, as bit rot on disk would.
    pub fn corrupt(&mut self, piece_index: u32) -> bool {
        match self.pieces.get_mut(&piece_index).and_then(|p| p.first_mut()) {
            Some(byte) => {
                *byte ^= 0xFF;
                true
            }
            None => false,
        }
    }

    /// Concatenation of all pieces, zero-filled where nothing was written.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (index, &len) in self.piece_lengths.iter().enumerate() {
            match self.pieces.get(&(index as u32)) {
                Some(piece) => out.extend_from_slice(piece),
                None => out.resize(out.len() + len as usize, 0),
            }
        }
        out
    }
}

impl PieceStorage for MemoryStorage {
    fn write_block(
        &mut self,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let piece_length = *self
            .piece_lengths
            .get(piece_index as usize)
            .ok_or(StorageError::Missing(piece_index))?;

        let start = offset as usize;
        let end = start + data.len();
        if end > piece_length as usize {
            return Err(StorageError::OutOfBounds {
                index: piece_index,
                offset,
                len: data.len(),
                piece_length,
            });
        }

        let piece = self
            .pieces
            .entry(piece_index)
            .or_insert_with(|| vec![0; piece_length as usize]);
        piece[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_piece(&self, piece_index: u32) -> Result<Vec<u8>, StorageError> {
        self.pieces
            .get(&piece_index)
            .cloned()
            .ok_or(StorageError::Missing(piece_index))
    }
}

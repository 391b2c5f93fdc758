use sha1::{Digest, Sha1};

pub type PieceDigest = [u8; 20];

/// Immutable per-piece facts the engine needs from the torrent's metainfo.
pub trait TorrentMetadata {
    fn piece_count(&self) -> u32;

    /// Length of piece `index` in bytes; the last piece may be shorter.
    fn piece_length(&self, index: u32) -> u32;

    fn expected_digest(&self, index: u32) -> Option<PieceDigest>;
}

/// SHA-1 digest of a piece's bytes.
pub fn piece_digest(data: &[u8]) -> PieceDigest {
    Sha1::digest(data).into()
}

/// Piece layout and hashes of a single torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub pieces: Vec<PieceDigest>,
}

impl Metainfo {
    pub fn new(
        name: impl Into<String>,
        piece_length: u32,
        total_length: u64,
        pieces: Vec<PieceDigest>,
    ) -> Self {
        Self {
            name: name.into(),
            piece_length,
            total_length,
            pieces,
        }
    }

    /// Hashes `content` into pieces of `piece_length` bytes.
    pub fn from_content(name: impl Into<String>, piece_length: u32, content: &[u8]) -> Self {
        let pieces = content
            .chunks(piece_length.max(1) as usize)
            .map(piece_digest)
            .collect();
        Self::new(name, piece_length, content.len() as u64, pieces)
    }
}

impl TorrentMetadata for Metainfo {
    fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    fn piece_length(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    fn expected_digest(&self, index: u32) -> Option<PieceDigest> {
        self.pieces.get(index as usize).copied()
    }
}

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::time::{Duration, Instant};

use tracing::{Level, event};

use crate::peer::PeerKey;
use crate::piece::BlockRequest;
use crate::piece::ranges::RangeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingBlock {
    length: u32,
    peer: PeerKey,
}

/// Block-level state of one piece that is being downloaded.
#[derive(Debug, Clone)]
pub struct ActivePiece {
    pub piece_index: u32,
    pub expected_length: u32,
    received: RangeSet,
    pending: BTreeMap<u32, PendingBlock>,
    assigned_peers: HashSet<PeerKey>,
    /// Set while the piece has no pending request and no contributor.
    orphaned_since: Option<Instant>,
}

impl ActivePiece {
    fn new(piece_index: u32, expected_length: u32, now: Instant) -> Self {
        Self {
            piece_index,
            expected_length,
            received: RangeSet::new(),
            pending: BTreeMap::new(),
            assigned_peers: HashSet::new(),
            orphaned_since: Some(now),
        }
    }

    pub fn received(&self) -> &RangeSet {
        &self.received
    }

    pub fn assigned_peers(&self) -> &HashSet<PeerKey> {
        &self.assigned_peers
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_fully_received(&self) -> bool {
        self.received.covers(&(0..self.expected_length))
    }

    fn next_unrequested_range(&self, block_size: u32) -> Option<Range<u32>> {
        let mut covered = self.received.clone();
        for (&offset, block) in &self.pending {
            covered.insert(offset..offset + block.length);
        }
        covered.first_gap(0..self.expected_length, block_size)
    }

    fn refresh_assigned(&mut self) {
        let pending = &self.pending;
        self.assigned_peers
            .retain(|peer| pending.values().any(|b| b.peer == *peer));
    }

    fn refresh_orphaned(&mut self, now: Instant) {
        if self.pending.is_empty() && self.assigned_peers.is_empty() {
            self.orphaned_since.get_or_insert(now);
        } else {
            self.orphaned_since = None;
        }
    }
}

/// Result of merging one block into an active piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Some bytes were new. `fresh` lists the sub-ranges not seen before.
    Accepted {
        fresh: Vec<Range<u32>>,
        complete: bool,
    },
    /// Every byte of the block had already been received.
    Duplicate,
    /// No active entry exists for the piece.
    NotTracked,
    /// The block extends past the end of the piece.
    OutOfBounds,
}

/// All pieces currently being downloaded, at most one entry per index.
#[derive(Debug, Default)]
pub struct ActivePieceTracker {
    pieces: HashMap<u32, ActivePiece>,
}

impl ActivePieceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `index`, creating it if needed. An existing
    /// entry is never replaced.
    pub fn begin_or_get(
        &mut self,
        index: u32,
        expected_length: u32,
        now: Instant,
    ) -> &mut ActivePiece {
        self.pieces.entry(index).or_insert_with(|| {
            event!(Level::DEBUG, piece = index, length = expected_length, "Piece activated");
            ActivePiece::new(index, expected_length, now)
        })
    }

    pub fn get(&self, index: u32) -> Option<&ActivePiece> {
        self.pieces.get(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.pieces.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Active indices in ascending order.
    pub fn indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.pieces.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Merges a received block. Partially overlapping data is clipped to its
    /// unseen part; fully duplicate data is ignored.
    pub fn record_block_received(
        &mut self,
        index: u32,
        offset: u32,
        data: &[u8],
        now: Instant,
    ) -> BlockOutcome {
        let Some(piece) = self.pieces.get_mut(&index) else {
            return BlockOutcome::NotTracked;
        };

        let end = match u32::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
        {
            Some(end) if end <= piece.expected_length => end,
            _ => return BlockOutcome::OutOfBounds,
        };

        let fresh = piece.received.insert(offset..end);

        let received = &piece.received;
        piece
            .pending
            .retain(|&start, block| !received.covers(&(start..start + block.length)));
        piece.refresh_assigned();
        piece.refresh_orphaned(now);

        if fresh.is_empty() {
            return BlockOutcome::Duplicate;
        }
        BlockOutcome::Accepted {
            fresh,
            complete: piece.is_fully_received(),
        }
    }

    /// Next sub-range of at most `block_size` bytes that is neither received
    /// nor pending.
    pub fn next_unrequested_range(&self, index: u32, block_size: u32) -> Option<Range<u32>> {
        self.pieces.get(&index)?.next_unrequested_range(block_size)
    }

    /// Records that `request` was sent to `peer`.
    pub fn mark_requested(&mut self, request: &BlockRequest, peer: PeerKey) {
        if let Some(piece) = self.pieces.get_mut(&request.piece_index) {
            piece.pending.insert(
                request.offset,
                PendingBlock {
                    length: request.length,
                    peer,
                },
            );
            piece.assigned_peers.insert(peer);
            piece.orphaned_since = None;
        }
    }

    /// Forgets one pending request so its range can be requested again.
    pub fn release_request(&mut self, request: &BlockRequest, peer: PeerKey, now: Instant) -> bool {
        let Some(piece) = self.pieces.get_mut(&request.piece_index) else {
            return false;
        };
        let released = match piece.pending.get(&request.offset) {
            Some(block) if block.peer == peer => {
                piece.pending.remove(&request.offset);
                true
            }
            _ => false,
        };
        piece.refresh_assigned();
        piece.refresh_orphaned(now);
        released
    }

    /// Forgets every request outstanding to `peer`. Returns how many were dropped.
    pub fn release_peer(&mut self, peer: PeerKey, now: Instant) -> usize {
        let mut released = 0;
        for piece in self.pieces.values_mut() {
            let before = piece.pending.len();
            piece.pending.retain(|_, block| block.peer != peer);
            released += before - piece.pending.len();
            piece.assigned_peers.remove(&peer);
            piece.refresh_orphaned(now);
        }
        released
    }

    /// Removes the entry for `index`. This is the whole reset for a piece.
    pub fn discard(&mut self, index: u32) -> Option<ActivePiece> {
        self.pieces.remove(&index)
    }

    /// Drops pieces that have had no contributor and no pending request for
    /// at least `threshold`, counted from the moment the last one went away.
    pub fn abandon_stalled(&mut self, now: Instant, threshold: Duration) -> Vec<u32> {
        let mut stalled: Vec<u32> = self
            .pieces
            .values()
            .filter(|p| {
                p.orphaned_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= threshold)
            })
            .map(|p| p.piece_index)
            .collect();
        stalled.sort_unstable();

        for index in &stalled {
            self.pieces.remove(index);
            event!(Level::DEBUG, piece = index, "Abandoned stalled piece");
        }
        stalled
    }
}

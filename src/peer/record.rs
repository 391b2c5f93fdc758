use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::peer::{PeerKey, PeerSource};
use crate::piece::{Bitfield, BlockRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed,
    /// Transitional; a completed transition never leaves a record here.
    Disconnected,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// Everything the engine knows about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    key: PeerKey,
    pub source: PeerSource,
    pub(crate) state: ConnectionState,
    pub(crate) connect_failures: u32,
    pub(crate) last_connect_attempt: Option<Instant>,
    pub(crate) connected_at: Option<Instant>,
    pub peer_choking: bool,
    pub am_interested: bool,
    /// What the peer claims to have, straight from its Bitfield/Have messages.
    pub remote_bitfield: Option<Bitfield>,
    pub pending_requests: HashMap<BlockRequest, Instant>, // Blocks we've requested with timestamps
    /// Blocks delivered during the current session.
    pub(crate) blocks_received: u64,
}

impl PeerRecord {
    pub fn new(key: PeerKey, source: PeerSource) -> Self {
        Self {
            key,
            source,
            state: ConnectionState::Idle,
            connect_failures: 0,
            last_connect_attempt: None,
            connected_at: None,
            peer_choking: true,
            am_interested: false,
            remote_bitfield: None,
            pending_requests: HashMap::new(),
            blocks_received: 0,
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connect_failures(&self) -> u32 {
        self.connect_failures
    }

    pub fn last_connect_attempt(&self) -> Option<Instant> {
        self.last_connect_attempt
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn blocks_received(&self) -> u64 {
        self.blocks_received
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.remote_bitfield
            .as_ref()
            .is_some_and(|bf| bf.has(index))
    }

    pub fn can_download(&self) -> bool {
        self.state == ConnectionState::Connected && !self.peer_choking && self.am_interested
    }

    pub fn pipeline_depth(&self) -> usize {
        self.pending_requests.len()
    }

    pub fn can_pipeline_request(&self, max_depth: usize) -> bool {
        self.can_download() && self.pending_requests.len() < max_depth
    }

    pub fn add_pending_request(&mut self, request: BlockRequest, now: Instant) {
        self.pending_requests.insert(request, now);
    }

    pub fn remove_pending_request(&mut self, request: &BlockRequest) -> bool {
        self.pending_requests.remove(request).is_some()
    }

    /// Removes the pending request that a received block answers, matching on
    /// position since the data length is all the block carries.
    pub fn complete_pending_request(
        &mut self,
        piece_index: u32,
        offset: u32,
    ) -> Option<BlockRequest> {
        let request = self
            .pending_requests
            .keys()
            .find(|r| r.piece_index == piece_index && r.offset == offset)
            .copied()?;
        self.pending_requests.remove(&request);
        Some(request)
    }

    pub fn get_timed_out_requests(&self, timeout: Duration, now: Instant) -> Vec<BlockRequest> {
        self.pending_requests
            .iter()
            .filter_map(|(request, sent_at)| {
                if now.saturating_duration_since(*sent_at) > timeout {
                    Some(*request)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn clear_timed_out_requests(
        &mut self,
        timeout: Duration,
        now: Instant,
    ) -> Vec<BlockRequest> {
        let timed_out = self.get_timed_out_requests(timeout, now);
        for request in &timed_out {
            self.pending_requests.remove(request);
        }
        timed_out
    }

    /// Drops per-connection state. Failure history is kept.
    pub(crate) fn reset_session(&mut self) {
        self.peer_choking = true;
        self.am_interested = false;
        self.remote_bitfield = None;
        self.pending_requests.clear();
        self.connected_at = None;
        self.blocks_received = 0;
    }
}

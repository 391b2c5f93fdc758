pub mod driver;
pub mod events;

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{Level, event};

pub use driver::{Command, DownloadHandle, Notification};
pub use events::{Effect, Event};

use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::peer::{
    ConnectFailure, ConnectionState, DisconnectReason, Outbound, PeerKey, PeerMessage, PeerRecord,
    PeerSource, Swarm, SwarmStats,
};
use crate::piece::{ActivePieceTracker, Bitfield, BlockOutcome, BlockRequest};
use crate::storage::PieceStorage;
use crate::torrent::{TorrentMetadata, piece_digest};

/// Counters kept over the lifetime of a download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub effective_ticks: u64,
    pub coalesced_ticks: u64,
    pub connect_attempts: u64,
    pub requests_sent: u64,
    pub request_timeouts: u64,
    pub pieces_verified: u64,
    pub hash_failures: u64,
    pub pieces_lost: u64,
}

/// Per-torrent orchestrator.
///
/// Owns the swarm, the local bitfield and the active piece tracker and is
/// the only thing that mutates them. Everything asynchronous happens
/// outside: results come back in as [`Event`]s and work goes out as
/// [`Effect`]s, both handled once per effective tick.
#[derive(Debug)]
pub struct Download<M, S> {
    config: EngineConfig,
    meta: M,
    storage: S,
    swarm: Swarm,
    bitfield: Bitfield,
    active: ActivePieceTracker,
    queue: VecDeque<Event>,
    /// Effects produced outside a tick, handed out by the next effective one.
    deferred: Vec<Effect>,
    last_run: Option<Instant>,
    stats: DownloadStats,
}

impl<M: TorrentMetadata, S: PieceStorage> Download<M, S> {
    pub fn new(config: EngineConfig, meta: M, storage: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let bitfield = Bitfield::new(meta.piece_count());
        Ok(Self {
            swarm: Swarm::new(config.backoff),
            config,
            meta,
            storage,
            bitfield,
            active: ActivePieceTracker::new(),
            queue: VecDeque::new(),
            deferred: Vec::new(),
            last_run: None,
            stats: DownloadStats::default(),
        })
    }

    /// Starts from a previously known completion state, e.g. after a resume.
    pub fn with_bitfield(mut self, bitfield: Bitfield) -> Self {
        if bitfield.total_count() == self.bitfield.total_count() {
            self.bitfield = bitfield;
        }
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &M {
        &self.meta
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn swarm(&self) -> &Swarm {
        &self.swarm
    }

    pub fn swarm_stats(&self) -> SwarmStats {
        self.swarm.stats()
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Copy of the completion bitfield in wire byte order.
    pub fn bitfield_snapshot(&self) -> Vec<u8> {
        self.bitfield.as_bytes().to_vec()
    }

    pub fn active(&self) -> &ActivePieceTracker {
        &self.active
    }

    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.is_complete()
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn add_peer(&mut self, key: PeerKey, source: PeerSource) -> bool {
        self.swarm.add_peer(key, source)
    }

    /// Forgets a peer for good, closing its session if it has one.
    pub fn ban_peer(&mut self, key: PeerKey, now: Instant) -> bool {
        let released = self.active.release_peer(key, now);
        let connected = self
            .swarm
            .get(&key)
            .is_some_and(|r| r.state() == ConnectionState::Connected);
        let known = self.swarm.ban(key).is_some();
        if connected {
            self.deferred.push(Effect::Disconnect(key));
        }
        event!(Level::DEBUG, peer = %key, released, "Banned peer");
        known
    }

    pub fn push_event(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Runs the maintenance pass unless one ran less than `tick_interval`
    /// ago, in which case the call is coalesced into that run and does nothing.
    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        if let Some(last) = self.last_run {
            if now.saturating_duration_since(last) < self.config.tick_interval {
                self.stats.coalesced_ticks += 1;
                return Vec::new();
            }
        }
        self.last_run = Some(now);
        self.stats.effective_ticks += 1;

        let mut effects = std::mem::take(&mut self.deferred);
        // Connect results land before new attempts are picked.
        self.drain_events(now, &mut effects);
        self.expire_connect_attempts(now);
        self.expire_requests(now, &mut effects);
        self.active.abandon_stalled(now, self.config.stall_threshold);
        self.start_connects(now, &mut effects);
        self.fill_pipelines(now, &mut effects);
        effects
    }

    /// Re-verifies every complete piece against storage and clears the ones
    /// that no longer match. Returns the cleared indices; the matching
    /// [`Effect::PieceLost`]s come out of the next effective tick.
    pub fn recheck(&mut self) -> Vec<u32> {
        let complete: Vec<u32> = (0..self.bitfield.total_count())
            .filter(|&i| self.bitfield.has(i))
            .collect();
        let mut cleared = Vec::new();
        let mut effects = std::mem::take(&mut self.deferred);
        for index in complete {
            if !self.piece_matches(index) {
                self.lose_piece(index, &mut effects);
                cleared.push(index);
            }
        }
        self.deferred = effects;
        event!(Level::INFO, cleared = cleared.len(), "Recheck finished");
        cleared
    }

    fn drain_events(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        while let Some(event) = self.queue.pop_front() {
            match event {
                Event::PeersDiscovered(peers) => {
                    for (key, source) in peers {
                        self.swarm.add_peer(key, source);
                    }
                }
                Event::ConnectSucceeded(key) => self.on_connected(key, now, effects),
                Event::ConnectFailed(key, reason) => {
                    if !self.swarm.mark_connect_failed(key, &reason, now) {
                        event!(Level::TRACE, peer = %key, %reason, "Stale connect failure ignored");
                    }
                }
                Event::Disconnected(key, reason) => self.on_disconnected(key, reason, now),
                Event::Message(key, message) => self.on_message(key, message, now, effects),
                Event::CorruptionDetected(index) => self.lose_piece(index, effects),
            }
        }
    }

    fn on_connected(&mut self, key: PeerKey, now: Instant, effects: &mut Vec<Effect>) {
        if let Err(e) = self.swarm.mark_connect_succeeded(key, now) {
            // Usually an attempt that already timed out on our side.
            event!(Level::DEBUG, peer = %key, error = %e, "Dropping late connection");
            effects.push(Effect::Disconnect(key));
            return;
        }
        let complete = self.bitfield.is_complete();
        if let Some(record) = self.swarm.get_mut(&key) {
            if !complete {
                record.am_interested = true;
                effects.push(Effect::Send(key, Outbound::Interested));
            }
        }
    }

    fn on_disconnected(&mut self, key: PeerKey, reason: DisconnectReason, now: Instant) {
        let released = self.active.release_peer(key, now);
        let state = self.swarm.get(&key).map(PeerRecord::state);
        match state {
            Some(ConnectionState::Connected) => {
                if let Err(e) = self.swarm.mark_disconnected(key, &reason, now) {
                    event!(Level::ERROR, peer = %key, error = %e, "Disconnect bookkeeping failed");
                }
                if released > 0 {
                    event!(
                        Level::DEBUG,
                        peer = %key,
                        released,
                        "Re-queued requests of disconnected peer"
                    );
                }
            }
            // The session died before its connect result was applied.
            Some(ConnectionState::Connecting) => {
                self.swarm
                    .mark_connect_failed(key, &ConnectFailure::Handshake(reason.to_string()), now);
            }
            _ => event!(Level::TRACE, peer = %key, "Disconnect for inactive peer ignored"),
        }
    }

    /// Ends a session on our side because the peer misbehaved.
    fn reject_peer(
        &mut self,
        key: PeerKey,
        violation: String,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        event!(Level::WARN, peer = %key, %violation, "Protocol violation");
        self.active.release_peer(key, now);
        let reason = DisconnectReason::ProtocolViolation(violation);
        if self.swarm.mark_disconnected(key, &reason, now).is_ok() {
            effects.push(Effect::Disconnect(key));
        }
    }

    fn on_message(
        &mut self,
        key: PeerKey,
        message: PeerMessage,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let piece_count = self.bitfield.total_count();
        let Some(record) = self.swarm.get_mut(&key) else {
            return;
        };
        if record.state() != ConnectionState::Connected {
            event!(
                Level::TRACE,
                peer = %key,
                kind = message.kind(),
                "Message from inactive peer ignored"
            );
            return;
        }

        match message {
            PeerMessage::Choke => {
                record.peer_choking = true;
                // A choking peer drops our queued requests.
                let dropped: Vec<BlockRequest> =
                    record.pending_requests.drain().map(|(r, _)| r).collect();
                for request in &dropped {
                    self.active.release_request(request, key, now);
                }
                event!(Level::DEBUG, peer = %key, dropped = dropped.len(), "Peer choked us");
            }
            PeerMessage::Unchoke => {
                record.peer_choking = false;
                event!(Level::DEBUG, peer = %key, "Peer unchoked us");
            }
            PeerMessage::Have(index) => {
                if index >= piece_count {
                    let violation = format!("have for piece {index} of {piece_count}");
                    self.reject_peer(key, violation, now, effects);
                    return;
                }
                record
                    .remote_bitfield
                    .get_or_insert_with(|| Bitfield::new(piece_count))
                    .set_piece(index);
            }
            PeerMessage::Bitfield(bytes) => {
                let expected = (piece_count as usize).div_ceil(8);
                if bytes.len() != expected {
                    self.reject_peer(
                        key,
                        format!("bitfield of {} bytes, expected {expected}", bytes.len()),
                        now,
                        effects,
                    );
                    return;
                }
                let remote = Bitfield::from_bytes(&bytes, piece_count);
                event!(
                    Level::DEBUG,
                    peer = %key,
                    pieces = remote.completed_count(),
                    "Received bitfield"
                );
                record.remote_bitfield = Some(remote);
            }
            PeerMessage::Reject(request) => {
                record.remove_pending_request(&request);
                self.active.release_request(&request, key, now);
            }
            PeerMessage::Piece { index, offset, data } => {
                record.complete_pending_request(index, offset);
                self.on_block(key, index, offset, &data, now, effects);
            }
        }
    }

    fn on_block(
        &mut self,
        key: PeerKey,
        index: u32,
        offset: u32,
        data: &[u8],
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if self.bitfield.has(index) {
            event!(Level::TRACE, peer = %key, piece = index, "Block for verified piece ignored");
            return;
        }

        match self.active.record_block_received(index, offset, data, now) {
            BlockOutcome::Accepted { fresh, complete } => {
                self.swarm.mark_productive(&key);

                for range in fresh {
                    let start = (range.start - offset) as usize;
                    let end = (range.end - offset) as usize;
                    let written = self.storage.write_block(index, range.start, &data[start..end]);
                    if let Err(e) = written {
                        event!(Level::ERROR, piece = index, error = %e, "Failed to store block");
                        self.active.discard(index);
                        self.forget_piece_requests(index, effects);
                        effects.push(Effect::PieceFailed(index));
                        return;
                    }
                }
                if complete {
                    self.complete_piece(index, effects);
                }
            }
            BlockOutcome::Duplicate => {
                event!(Level::TRACE, peer = %key, piece = index, offset, "Duplicate block");
            }
            BlockOutcome::NotTracked => {
                event!(
                    Level::TRACE,
                    peer = %key,
                    piece = index,
                    offset,
                    "Unsolicited block ignored"
                );
            }
            BlockOutcome::OutOfBounds => {
                self.reject_peer(
                    key,
                    format!("block {index}:{offset}+{} past end of piece", data.len()),
                    now,
                    effects,
                );
            }
        }
    }

    fn piece_matches(&self, index: u32) -> bool {
        let Some(expected) = self.meta.expected_digest(index) else {
            return false;
        };
        match self.storage.read_piece(index) {
            Ok(data) => {
                data.len() == self.meta.piece_length(index) as usize
                    && piece_digest(&data) == expected
            }
            Err(e) => {
                event!(
                    Level::WARN,
                    piece = index,
                    error = %e,
                    "Could not read piece for verification"
                );
                false
            }
        }
    }

    /// Verifies a fully received piece and settles it either way.
    fn complete_piece(&mut self, index: u32, effects: &mut Vec<Effect>) {
        let matches = self.piece_matches(index);
        if matches && self.bitfield.set_complete(index).is_ok() {
            self.active.discard(index);
            self.stats.pieces_verified += 1;
            event!(
                Level::INFO,
                piece = index,
                completed = self.bitfield.completed_count(),
                total = self.bitfield.total_count(),
                "Piece verified"
            );
            self.forget_piece_requests(index, effects);
            effects.push(Effect::PieceVerified(index));
            for key in self.swarm.connected_keys() {
                effects.push(Effect::Send(key, Outbound::Have(index)));
            }
            if self.bitfield.is_complete() {
                self.on_download_complete(effects);
            }
        } else {
            self.active.discard(index);
            self.stats.hash_failures += 1;
            event!(Level::WARN, piece = index, "Piece failed hash check");
            self.forget_piece_requests(index, effects);
            effects.push(Effect::PieceFailed(index));
        }
    }

    fn on_download_complete(&mut self, effects: &mut Vec<Effect>) {
        event!(Level::INFO, pieces = self.bitfield.total_count(), "Download complete");
        for key in self.swarm.connected_keys() {
            if let Some(record) = self.swarm.get_mut(&key) {
                if record.am_interested {
                    record.am_interested = false;
                    effects.push(Effect::Send(key, Outbound::NotInterested));
                }
            }
        }
        effects.push(Effect::Completed);
    }

    /// Drops pending requests for `index` from every peer, cancelling them on the wire.
    fn forget_piece_requests(&mut self, index: u32, effects: &mut Vec<Effect>) {
        for key in self.swarm.connected_keys() {
            let Some(record) = self.swarm.get_mut(&key) else {
                continue;
            };
            let stale: Vec<BlockRequest> = record
                .pending_requests
                .keys()
                .filter(|r| r.piece_index == index)
                .copied()
                .collect();
            for request in stale {
                record.remove_pending_request(&request);
                effects.push(Effect::Send(key, Outbound::Cancel(request)));
            }
        }
    }

    /// Marks a verified piece missing again. Clearing the bit is the whole
    /// reset: no tracker entry exists for a verified piece.
    fn lose_piece(&mut self, index: u32, effects: &mut Vec<Effect>) {
        if !self.bitfield.has(index) {
            return;
        }
        let was_complete = self.bitfield.is_complete();
        if self.bitfield.clear(index).is_err() {
            return;
        }
        self.stats.pieces_lost += 1;
        event!(Level::WARN, piece = index, "Verified piece found corrupted, marking missing");
        effects.push(Effect::PieceLost(index));

        if was_complete {
            for key in self.swarm.connected_keys() {
                if let Some(record) = self.swarm.get_mut(&key) {
                    if !record.am_interested {
                        record.am_interested = true;
                        effects.push(Effect::Send(key, Outbound::Interested));
                    }
                }
            }
        }
    }

    fn expire_connect_attempts(&mut self, now: Instant) {
        for key in self.swarm.expired_attempts(now) {
            event!(Level::DEBUG, peer = %key, "Connect attempt timed out");
            self.swarm.mark_connect_failed(key, &ConnectFailure::Timeout, now);
        }
    }

    fn expire_requests(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        let timeout = self.config.request_timeout;
        for key in self.swarm.connected_keys() {
            let Some(record) = self.swarm.get_mut(&key) else {
                continue;
            };
            let timed_out = record.clear_timed_out_requests(timeout, now);
            if timed_out.is_empty() {
                continue;
            }
            event!(Level::DEBUG, peer = %key, count = timed_out.len(), "Requests timed out");
            self.stats.request_timeouts += timed_out.len() as u64;
            for request in timed_out {
                self.active.release_request(&request, key, now);
                effects.push(Effect::Send(key, Outbound::Cancel(request)));
            }
        }
    }

    fn start_connects(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if self.bitfield.is_complete() {
            return;
        }
        let in_use = self.swarm.count_connecting() + self.swarm.count_connected();
        let free = self.config.max_connections.saturating_sub(in_use);
        if free == 0 {
            return;
        }

        let deadline = now + self.config.connect_timeout;
        for key in self.swarm.get_connectable_peers(free, now) {
            match self.swarm.mark_connect_attempt_started(key, now, deadline) {
                Ok(()) => {
                    self.stats.connect_attempts += 1;
                    effects.push(Effect::Connect(key));
                }
                Err(e) => {
                    debug_assert!(false, "connectable peer rejected: {e}");
                    event!(Level::ERROR, peer = %key, error = %e, "Connectable peer rejected");
                }
            }
        }
    }

    fn fill_pipelines(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if self.bitfield.is_complete() {
            return;
        }
        let depth = self.config.pipeline_depth;
        let block_size = self.config.block_size;

        for key in self.swarm.connected_keys() {
            let Some(record) = self.swarm.get_mut(&key) else {
                continue;
            };
            while record.can_pipeline_request(depth) {
                let picked = pick_block(
                    &self.bitfield,
                    &mut self.active,
                    &self.meta,
                    record,
                    block_size,
                    now,
                );
                let Some(request) = picked else {
                    break;
                };
                self.active.mark_requested(&request, key);
                record.add_pending_request(request, now);
                self.stats.requests_sent += 1;
                effects.push(Effect::Send(key, Outbound::Request(request)));
            }
        }
    }
}

/// Chooses the next block to ask `record` for.
///
/// Pieces already in progress come first so few pieces are open at once;
/// otherwise the lowest missing index the peer has is started.
fn pick_block(
    bitfield: &Bitfield,
    active: &mut ActivePieceTracker,
    meta: &impl TorrentMetadata,
    record: &PeerRecord,
    block_size: u32,
    now: Instant,
) -> Option<BlockRequest> {
    for index in active.indices() {
        if !record.has_piece(index) {
            continue;
        }
        if let Some(range) = active.next_unrequested_range(index, block_size) {
            return Some(BlockRequest::from_range(index, range));
        }
    }

    let index = bitfield
        .missing_indices()
        .find(|&i| !active.contains(i) && record.has_piece(i) && meta.piece_length(i) > 0)?;
    active.begin_or_get(index, meta.piece_length(index), now);
    let range = active.next_unrequested_range(index, block_size)?;
    Some(BlockRequest::from_range(index, range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::torrent::Metainfo;
    use assert_matches::assert_matches;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    const PIECE_LENGTH: u32 = 32;
    const STEP: Duration = Duration::from_millis(100);

    fn key(port: u16) -> PeerKey {
        SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), port))
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_block_size(16)
            .with_tick_interval(STEP)
    }

    fn only(pieces: u32, index: u32) -> Bitfield {
        let mut have = Bitfield::new(pieces);
        have.set_piece(index);
        have
    }

    fn requests(effects: &[Effect]) -> Vec<(PeerKey, BlockRequest)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(key, Outbound::Request(req)) => Some((*key, *req)),
                _ => None,
            })
            .collect()
    }

    fn count_connects(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Connect(_)))
            .count()
    }

    struct Harness {
        download: Download<Metainfo, MemoryStorage>,
        content: Vec<u8>,
        now: Instant,
    }

    impl Harness {
        fn new(config: EngineConfig, len: usize) -> Self {
            let content = content(len);
            let meta = Metainfo::from_content("test", PIECE_LENGTH, &content);
            let storage = MemoryStorage::new(&meta);
            Harness {
                download: Download::new(config, meta, storage).unwrap(),
                content,
                now: Instant::now(),
            }
        }

        fn step(&mut self) -> Vec<Effect> {
            self.now += STEP;
            self.download.tick(self.now)
        }

        fn advance(&mut self, by: Duration) -> Vec<Effect> {
            self.now += by;
            self.download.tick(self.now)
        }

        fn push(&mut self, event: Event) {
            self.download.push_event(event);
        }

        /// Dials `port`, completes the connection and announces `have`.
        /// Returns the effects of the tick that applied the connection.
        fn connect(&mut self, port: u16, have: &Bitfield, unchoke: bool) -> Vec<Effect> {
            let peer = key(port);
            self.download.add_peer(peer, PeerSource::Tracker);
            let effects = self.step();
            assert!(effects.contains(&Effect::Connect(peer)));

            self.push(Event::ConnectSucceeded(peer));
            self.push(Event::Message(peer, PeerMessage::Bitfield(have.as_bytes().to_vec())));
            if unchoke {
                self.push(Event::Message(peer, PeerMessage::Unchoke));
            }
            self.step()
        }

        fn serve(&mut self, peer: PeerKey, req: BlockRequest) {
            let start = (req.piece_index * PIECE_LENGTH + req.offset) as usize;
            let data = self.content[start..start + req.length as usize].to_vec();
            self.push(Event::Message(
                peer,
                PeerMessage::Piece {
                    index: req.piece_index,
                    offset: req.offset,
                    data,
                },
            ));
        }

        fn serve_garbage(&mut self, peer: PeerKey, req: BlockRequest) {
            self.push(Event::Message(
                peer,
                PeerMessage::Piece {
                    index: req.piece_index,
                    offset: req.offset,
                    data: vec![0xAA; req.length as usize],
                },
            ));
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let meta = Metainfo::from_content("x", 4, &[0; 8]);
        let storage = MemoryStorage::new(&meta);
        assert_matches!(
            Download::new(EngineConfig::default().with_pipeline_depth(0), meta, storage),
            Err(ConfigError::Zero("pipeline_depth"))
        );
    }

    #[test]
    fn test_tick_coalesces_within_interval() {
        let mut h = Harness::new(config(), 64);
        let peer = key(1);
        h.download.add_peer(peer, PeerSource::Manual);

        let start = h.now;
        assert_eq!(h.download.tick(start), vec![Effect::Connect(peer)]);

        h.push(Event::ConnectFailed(peer, ConnectFailure::Refused));
        assert!(h.download.tick(start + Duration::from_millis(50)).is_empty());
        assert_eq!(h.download.pending_events(), 1);
        assert_eq!(h.download.stats().coalesced_ticks, 1);

        assert!(h.download.tick(start + STEP).is_empty());
        assert_eq!(h.download.pending_events(), 0);
        assert_eq!(h.download.stats().effective_ticks, 2);
    }

    #[test]
    fn test_connect_failure_backs_off_one_second() {
        let mut h = Harness::new(config(), 64);
        let peer = key(1);
        h.download.add_peer(peer, PeerSource::Tracker);
        assert_eq!(count_connects(&h.step()), 1);

        h.push(Event::ConnectFailed(peer, ConnectFailure::Refused));
        let effects = h.step();
        assert_eq!(count_connects(&effects), 0);

        let failed_at = h.now;
        let record = h.download.swarm().get(&peer).unwrap();
        assert_eq!(record.state(), ConnectionState::Failed);
        assert_eq!(record.connect_failures(), 1);
        assert_eq!(
            h.download.swarm().next_eligible_at(&peer),
            Some(failed_at + Duration::from_millis(1000))
        );

        // Still inside the window.
        assert_eq!(count_connects(&h.advance(Duration::from_millis(800))), 0);
        assert_eq!(count_connects(&h.advance(Duration::from_millis(200))), 1);
    }

    #[test]
    fn test_connect_burst_bounded_by_backoff_floor() {
        let mut h = Harness::new(config().with_tick_interval(Duration::from_millis(1)), 64);
        let peer = key(1);
        let start = h.now;
        let mut attempts = 0;

        for i in 0..28_000u64 {
            let now = start + Duration::from_micros(i * 35);
            h.download.add_peer(peer, PeerSource::Tracker);
            for effect in h.download.tick(now) {
                if effect == Effect::Connect(peer) {
                    attempts += 1;
                    h.push(Event::ConnectFailed(peer, ConnectFailure::Refused));
                }
            }
        }

        assert_eq!(attempts, 1);
        assert_eq!(h.download.stats().connect_attempts, 1);
        assert_eq!(h.download.swarm().len(), 1);
    }

    #[test]
    fn test_long_burst_attempts_follow_exponential_backoff() {
        let mut h = Harness::new(config().with_tick_interval(Duration::from_millis(1)), 64);
        let peer = key(1);
        let start = h.now;
        let mut attempts = 0u64;
        let mut last = start;

        for i in 0..28_000u64 {
            last = start + Duration::from_micros(i * 360);
            h.download.add_peer(peer, PeerSource::Tracker);
            for effect in h.download.tick(last) {
                if effect == Effect::Connect(peer) {
                    attempts += 1;
                    h.push(Event::ConnectFailed(peer, ConnectFailure::Refused));
                }
            }
        }

        let elapsed = last - start;
        assert!(attempts <= 1 + elapsed.as_secs());
        // 0s, 1s, 3s, 7s; the next would be at 15s.
        assert_eq!(attempts, 4);
    }

    #[test]
    fn test_max_connections_limits_attempts() {
        let mut h = Harness::new(config().with_max_connections(2), 64);
        for port in 1..=5 {
            h.download.add_peer(key(port), PeerSource::Dht);
        }
        assert_eq!(count_connects(&h.step()), 2);
        assert_eq!(count_connects(&h.step()), 0);

        h.push(Event::ConnectFailed(key(1), ConnectFailure::Refused));
        assert_eq!(count_connects(&h.step()), 1);
        assert_eq!(h.download.swarm().count_connecting(), 2);
    }

    #[test]
    fn test_connected_peer_gets_interested_and_pipelined_requests() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let effects = h.connect(1, &Bitfield::full(8), true);

        assert!(effects.contains(&Effect::Send(key(1), Outbound::Interested)));
        let reqs = requests(&effects);
        assert_eq!(reqs.len(), 5);
        assert_eq!(
            reqs.iter().map(|(_, r)| (r.piece_index, r.offset)).collect::<Vec<_>>(),
            vec![(0, 0), (0, 16), (1, 0), (1, 16), (2, 0)]
        );
        assert_eq!(h.download.swarm().get(&key(1)).unwrap().pipeline_depth(), 5);

        // Full pipeline, nothing more until something comes back.
        assert!(requests(&h.step()).is_empty());
    }

    #[test]
    fn test_choked_peer_gets_no_requests() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let effects = h.connect(1, &Bitfield::full(8), false);
        assert!(requests(&effects).is_empty());
        assert!(h.download.active().is_empty());
    }

    #[test]
    fn test_peers_never_share_a_block() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        for port in 1..=3 {
            h.download.add_peer(key(port), PeerSource::Tracker);
        }
        h.step();
        for port in 1..=3 {
            h.push(Event::ConnectSucceeded(key(port)));
            h.push(Event::Message(key(port), PeerMessage::Bitfield(vec![0xFF])));
            h.push(Event::Message(key(port), PeerMessage::Unchoke));
        }
        let reqs = requests(&h.step());

        // 16 blocks in total, 15 slots offered.
        assert_eq!(reqs.len(), 15);
        let distinct: HashSet<(u32, u32)> =
            reqs.iter().map(|(_, r)| (r.piece_index, r.offset)).collect();
        assert_eq!(distinct.len(), reqs.len());
        assert_eq!(h.download.active().len(), 8);
        assert_eq!(h.download.active().indices(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_verified_piece_sets_bit_and_announces_have() {
        let pieces = 8;
        let mut h = Harness::new(config(), (pieces * PIECE_LENGTH) as usize);
        h.connect(2, &Bitfield::full(pieces), false);
        let reqs = requests(&h.connect(1, &only(pieces, 3), true));
        assert_eq!(reqs.len(), 2);

        for (peer, req) in reqs {
            h.serve(peer, req);
        }
        let effects = h.step();

        assert!(effects.contains(&Effect::PieceVerified(3)));
        assert!(effects.contains(&Effect::Send(key(1), Outbound::Have(3))));
        assert!(effects.contains(&Effect::Send(key(2), Outbound::Have(3))));
        assert!(h.download.bitfield().has(3));
        assert!(!h.download.active().contains(3));
        assert_eq!(h.download.stats().pieces_verified, 1);
        assert_eq!(h.download.bitfield_snapshot(), vec![0b0001_0000]);
    }

    #[test]
    fn test_hash_mismatch_discards_and_reselects_piece() {
        let pieces = 8;
        let mut h = Harness::new(config(), (pieces * PIECE_LENGTH) as usize);
        let reqs = requests(&h.connect(1, &only(pieces, 5), true));
        assert_eq!(reqs.len(), 2);

        for (peer, req) in reqs.iter().copied() {
            h.serve_garbage(peer, req);
        }
        let effects = h.step();

        assert!(effects.contains(&Effect::PieceFailed(5)));
        assert!(!h.download.bitfield().has(5));
        assert!(h.download.bitfield().missing_indices().any(|i| i == 5));
        assert_eq!(h.download.stats().hash_failures, 1);

        // A fresh entry is started for the retry within the same tick.
        let retry = requests(&effects);
        assert_eq!(retry, reqs);
        let piece = h.download.active().get(5).unwrap();
        assert!(piece.received().is_empty());
        assert_eq!(piece.pending_count(), 2);
    }

    #[test]
    fn test_corruption_clears_bit_and_piece_is_reselected() {
        let pieces = 8;
        let mut h = Harness::new(config(), (pieces * PIECE_LENGTH) as usize);
        let reqs = requests(&h.connect(1, &only(pieces, 7), true));
        for (peer, req) in reqs.iter().copied() {
            h.serve(peer, req);
        }
        assert!(h.step().contains(&Effect::PieceVerified(7)));

        h.push(Event::CorruptionDetected(7));
        let effects = h.step();

        assert!(effects.contains(&Effect::PieceLost(7)));
        assert!(!h.download.bitfield().has(7));
        assert_eq!(requests(&effects), reqs);

        // Unknown or already missing pieces are ignored.
        h.push(Event::CorruptionDetected(7));
        h.push(Event::CorruptionDetected(99));
        assert!(!h.step().contains(&Effect::PieceLost(7)));
        assert_eq!(h.download.stats().pieces_lost, 1);
    }

    #[test]
    fn test_recheck_clears_only_corrupted_pieces() {
        let pieces = 2;
        let mut h = Harness::new(config(), (pieces * PIECE_LENGTH) as usize);
        let reqs = requests(&h.connect(1, &Bitfield::full(pieces), true));
        assert_eq!(reqs.len(), 4);
        for (peer, req) in reqs {
            h.serve(peer, req);
        }
        let effects = h.step();
        assert!(effects.contains(&Effect::Completed));

        assert!(h.download.recheck().is_empty());
        assert!(h.download.storage_mut().corrupt(1));
        assert_eq!(h.download.recheck(), vec![1]);
        assert!(h.download.bitfield().has(0));
        assert!(!h.download.bitfield().has(1));

        // The loss is reported, and the finished download becomes interested again.
        let effects = h.step();
        assert!(effects.contains(&Effect::PieceLost(1)));
        assert!(effects.contains(&Effect::Send(key(1), Outbound::Interested)));
        assert_eq!(requests(&effects).len(), 2);
    }

    #[test]
    fn test_full_download_with_short_last_piece() {
        let len = 3 * PIECE_LENGTH as usize - 8;
        let mut h = Harness::new(config(), len);
        let mut effects = h.connect(1, &Bitfield::full(3), true);
        let mut lengths = Vec::new();

        for _ in 0..10 {
            if effects.contains(&Effect::Completed) {
                break;
            }
            for (peer, req) in requests(&effects) {
                lengths.push(req.length);
                h.serve(peer, req);
            }
            effects = h.step();
        }

        assert!(effects.contains(&Effect::Completed));
        assert!(effects.contains(&Effect::Send(key(1), Outbound::NotInterested)));
        assert!(h.download.is_complete());
        assert!(h.download.active().is_empty());
        assert_eq!(h.download.storage().contents(), h.content);
        assert_eq!(lengths, vec![16, 16, 16, 16, 16, 8]);

        // No more dialling once complete.
        h.download.add_peer(key(9), PeerSource::Pex);
        assert_eq!(count_connects(&h.step()), 0);
    }

    #[test]
    fn test_overlapping_blocks_are_clipped() {
        let mut h = Harness::new(config(), PIECE_LENGTH as usize);
        let reqs = requests(&h.connect(1, &Bitfield::full(1), true));
        assert_eq!(reqs.len(), 2);

        let peer = key(1);
        // One block straddling both requested ranges, then the second range again.
        h.push(Event::Message(
            peer,
            PeerMessage::Piece {
                index: 0,
                offset: 8,
                data: h.content[8..24].to_vec(),
            },
        ));
        h.serve(peer, reqs[1].1);
        assert!(!h.step().contains(&Effect::PieceVerified(0)));
        assert_eq!(h.download.active().get(0).unwrap().received().covered_len(), 24);

        h.serve(peer, reqs[0].1);
        let effects = h.step();
        assert!(effects.contains(&Effect::PieceVerified(0)));
        assert_eq!(h.download.storage().contents(), h.content);
    }

    #[test]
    fn test_choke_releases_requests_until_unchoke() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let first = requests(&h.connect(1, &Bitfield::full(8), true));
        assert_eq!(first.len(), 5);

        h.push(Event::Message(key(1), PeerMessage::Choke));
        assert!(requests(&h.step()).is_empty());
        assert_eq!(h.download.swarm().get(&key(1)).unwrap().pipeline_depth(), 0);
        let active = h.download.active();
        assert!(
            active
                .indices()
                .iter()
                .all(|&i| active.get(i).unwrap().pending_count() == 0)
        );

        h.push(Event::Message(key(1), PeerMessage::Unchoke));
        assert_eq!(requests(&h.step()), first);
    }

    #[test]
    fn test_reject_releases_single_request() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let first = requests(&h.connect(1, &Bitfield::full(8), true));
        let (peer, rejected) = first[2];

        h.push(Event::Message(peer, PeerMessage::Reject(rejected)));
        assert_eq!(requests(&h.step()), vec![(peer, rejected)]);
    }

    #[test]
    fn test_disconnect_moves_requests_to_other_peer() {
        let mut h = Harness::new(config(), 2 * PIECE_LENGTH as usize);
        h.download.add_peer(key(1), PeerSource::Tracker);
        h.download.add_peer(key(2), PeerSource::Tracker);
        h.step();
        h.push(Event::ConnectSucceeded(key(1)));
        h.push(Event::Message(key(1), PeerMessage::Bitfield(vec![0xC0])));
        h.push(Event::Message(key(1), PeerMessage::Unchoke));
        h.push(Event::ConnectSucceeded(key(2)));
        h.push(Event::Message(key(2), PeerMessage::Bitfield(vec![0xC0])));
        let reqs = requests(&h.step());
        assert_eq!(reqs.len(), 4);
        assert!(reqs.iter().all(|(peer, _)| *peer == key(1)));

        h.push(Event::Disconnected(key(1), DisconnectReason::Error("reset".into())));
        h.push(Event::Message(key(2), PeerMessage::Unchoke));
        let moved = requests(&h.step());
        assert_eq!(moved.len(), 4);
        assert!(moved.iter().all(|(peer, _)| *peer == key(2)));

        let record = h.download.swarm().get(&key(1)).unwrap();
        assert_eq!(record.state(), ConnectionState::Failed);
        assert_eq!(record.connect_failures(), 1);
        assert!(record.pending_requests.is_empty());
    }

    #[test]
    fn test_quick_disconnects_grow_backoff_until_data_arrives() {
        let mut h = Harness::new(config(), PIECE_LENGTH as usize);
        let peer = key(1);
        h.download.add_peer(peer, PeerSource::Tracker);

        for expected in 1..=3u32 {
            let mut effects = h.step();
            while !effects.contains(&Effect::Connect(peer)) {
                effects = h.step();
            }
            h.push(Event::ConnectSucceeded(peer));
            h.step();
            h.push(Event::Disconnected(peer, DisconnectReason::Error("eof".into())));
            h.step();
            assert_eq!(h.download.swarm().get(&peer).unwrap().connect_failures(), expected);
            assert_eq!(
                h.download.swarm().next_eligible_at(&peer),
                Some(h.now + Duration::from_secs(1 << (expected - 1)))
            );
        }

        let mut effects = h.step();
        while !effects.contains(&Effect::Connect(peer)) {
            effects = h.step();
        }
        h.push(Event::ConnectSucceeded(peer));
        h.push(Event::Message(peer, PeerMessage::Bitfield(vec![0x80])));
        h.push(Event::Message(peer, PeerMessage::Unchoke));
        let reqs = requests(&h.step());
        h.serve(peer, reqs[0].1);
        h.step();
        assert_eq!(h.download.swarm().get(&peer).unwrap().connect_failures(), 0);
    }

    #[test]
    fn test_clean_hang_ups_are_not_redialled_every_tick() {
        let mut h = Harness::new(config(), PIECE_LENGTH as usize);
        let peer = key(1);
        h.download.add_peer(peer, PeerSource::Tracker);

        let mut attempts = 0;
        for _ in 0..100 {
            if h.step().contains(&Effect::Connect(peer)) {
                attempts += 1;
                h.push(Event::ConnectSucceeded(peer));
                h.push(Event::Disconnected(peer, DisconnectReason::Graceful));
            }
        }

        // Dialled at 0.1s, 1.2s, 3.3s and 7.4s; the next one is due at 15.5s.
        assert_eq!(attempts, 4);
        let record = h.download.swarm().get(&peer).unwrap();
        assert_eq!(record.state(), ConnectionState::Failed);
        assert_eq!(record.connect_failures(), 4);
    }

    #[test]
    fn test_connect_timeout_and_late_success() {
        let mut h = Harness::new(config().with_connect_timeout(Duration::from_secs(10)), 64);
        let peer = key(1);
        h.download.add_peer(peer, PeerSource::Tracker);
        assert_eq!(count_connects(&h.step()), 1);

        assert_eq!(count_connects(&h.advance(Duration::from_secs(5))), 0);
        assert!(h.download.swarm().is_connecting(&peer));

        h.advance(Duration::from_secs(5));
        assert!(!h.download.swarm().is_connecting(&peer));
        let record = h.download.swarm().get(&peer).unwrap();
        assert_eq!(record.state(), ConnectionState::Failed);
        assert_eq!(record.connect_failures(), 1);

        h.push(Event::ConnectSucceeded(peer));
        let effects = h.step();
        assert!(effects.contains(&Effect::Disconnect(peer)));
        assert_eq!(h.download.swarm().get(&peer).unwrap().state(), ConnectionState::Failed);
    }

    #[test]
    fn test_request_timeout_cancels_and_reissues() {
        let config = config().with_request_timeout(Duration::from_secs(30));
        let mut h = Harness::new(config, 8 * PIECE_LENGTH as usize);
        let first = requests(&h.connect(1, &Bitfield::full(8), true));

        let effects = h.advance(Duration::from_secs(31));
        let cancels = effects
            .iter()
            .filter(|e| matches!(e, Effect::Send(_, Outbound::Cancel(_))))
            .count();
        assert_eq!(cancels, 5);
        assert_eq!(h.download.stats().request_timeouts, 5);

        let mut again = requests(&effects);
        let mut first = first;
        again.sort_by_key(|(_, r)| (r.piece_index, r.offset));
        first.sort_by_key(|(_, r)| (r.piece_index, r.offset));
        assert_eq!(again, first);
    }

    #[test]
    fn test_stalled_piece_is_abandoned() {
        let config = config().with_stall_threshold(Duration::from_secs(60));
        let mut h = Harness::new(config, 8 * PIECE_LENGTH as usize);
        h.connect(1, &Bitfield::full(8), true);
        assert_eq!(h.download.active().len(), 3);

        h.push(Event::Disconnected(key(1), DisconnectReason::Graceful));
        h.step();
        assert_eq!(h.download.active().len(), 3);

        h.advance(Duration::from_secs(50));
        assert_eq!(h.download.active().len(), 3);
        h.advance(Duration::from_secs(11));
        assert!(h.download.active().is_empty());
    }

    #[test]
    fn test_stall_threshold_counts_from_last_contributor_leaving() {
        let config = config()
            .with_stall_threshold(Duration::from_secs(60))
            .with_request_timeout(Duration::from_secs(120));
        let mut h = Harness::new(config, 8 * PIECE_LENGTH as usize);
        h.connect(1, &Bitfield::full(8), true);
        assert_eq!(h.download.active().len(), 3);

        h.advance(Duration::from_secs(59));
        h.push(Event::Disconnected(key(1), DisconnectReason::Graceful));
        h.step();
        h.advance(Duration::from_secs(1));
        assert_eq!(h.download.active().len(), 3);

        h.advance(Duration::from_secs(58));
        assert_eq!(h.download.active().len(), 3);
        h.advance(Duration::from_secs(2));
        assert!(h.download.active().is_empty());
    }

    #[test]
    fn test_bad_bitfield_length_drops_peer() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let peer = key(1);
        h.download.add_peer(peer, PeerSource::Tracker);
        h.step();
        h.push(Event::ConnectSucceeded(peer));
        h.push(Event::Message(peer, PeerMessage::Bitfield(vec![0xFF, 0xFF])));
        let effects = h.step();

        assert!(effects.contains(&Effect::Disconnect(peer)));
        let record = h.download.swarm().get(&peer).unwrap();
        assert_eq!(record.state(), ConnectionState::Failed);
        assert_eq!(record.connect_failures(), 1);
    }

    #[test]
    fn test_have_out_of_range_drops_peer() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let peer = key(1);
        h.connect(1, &Bitfield::new(8), true);
        h.push(Event::Message(peer, PeerMessage::Have(8)));
        assert!(h.step().contains(&Effect::Disconnect(peer)));
    }

    #[test]
    fn test_have_makes_piece_requestable() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let peer = key(1);
        assert!(requests(&h.connect(1, &Bitfield::new(8), true)).is_empty());

        h.push(Event::Message(peer, PeerMessage::Have(6)));
        let reqs = requests(&h.step());
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|(_, r)| r.piece_index == 6));
    }

    #[test]
    fn test_disconnect_while_connecting_counts_as_failure() {
        let mut h = Harness::new(config(), 64);
        let peer = key(1);
        h.download.add_peer(peer, PeerSource::Tracker);
        h.step();

        h.push(Event::Disconnected(peer, DisconnectReason::Error("reset".into())));
        h.step();
        let record = h.download.swarm().get(&peer).unwrap();
        assert_eq!(record.state(), ConnectionState::Failed);
        assert_eq!(record.connect_failures(), 1);
        assert!(!h.download.swarm().is_connecting(&peer));
    }

    #[test]
    fn test_discovered_peers_are_deduplicated() {
        let mut h = Harness::new(config(), 64);
        h.push(Event::PeersDiscovered(vec![
            (key(1), PeerSource::Tracker),
            (key(1), PeerSource::Dht),
            (key(2), PeerSource::Pex),
        ]));
        assert_eq!(count_connects(&h.step()), 2);
        assert_eq!(h.download.swarm().len(), 2);
        assert!(!h.download.add_peer(key(2), PeerSource::Manual));
    }

    #[test]
    fn test_banned_peer_is_dropped_and_not_readded() {
        let mut h = Harness::new(config(), 8 * PIECE_LENGTH as usize);
        let reqs = requests(&h.connect(1, &Bitfield::full(8), true));
        assert_eq!(reqs.len(), 5);

        assert!(h.download.ban_peer(key(1), h.now));
        assert!(h.download.swarm().get(&key(1)).is_none());
        assert!(h.download.swarm().is_banned(&key(1)));
        assert!(!h.download.add_peer(key(1), PeerSource::Pex));

        // Late data from the banned peer is ignored.
        h.serve(key(1), reqs[0].1);
        let effects = h.step();
        assert!(effects.contains(&Effect::Disconnect(key(1))));
        assert!(h.download.active().get(0).unwrap().received().is_empty());
        assert_eq!(h.download.active().get(0).unwrap().pending_count(), 0);
    }

    #[test]
    fn test_with_bitfield_resumes_progress() {
        let h = Harness::new(config(), 4 * PIECE_LENGTH as usize);
        let resumed = h.download.with_bitfield(Bitfield::from_bytes(&[0b1010_0000], 4));
        assert!(resumed.bitfield().has(0));
        assert!(resumed.bitfield().has(2));
        assert_eq!(resumed.bitfield().missing_indices().collect::<Vec<_>>(), vec![1, 3]);
    }
}

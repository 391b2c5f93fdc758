use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use tracing::{Level, event};

use crate::config::BackoffPolicy;
use crate::error::SwarmError;
use crate::peer::record::{ConnectionState, PeerRecord};
use crate::peer::{ConnectFailure, DisconnectReason, PeerKey, PeerSource};

/// Counts by state and by source, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub total: usize,
    pub idle: usize,
    pub connecting: usize,
    pub connected: usize,
    pub failed: usize,
    pub banned: usize,
    pub by_source: BTreeMap<PeerSource, usize>,
}

/// Registry of every known peer for one torrent.
///
/// Owns the connection state machine and decides who may be dialled and
/// when. Connect attempts in flight are tracked separately from the records
/// so failure bookkeeping works even when a record has gone away.
#[derive(Debug)]
pub struct Swarm {
    peers: HashMap<PeerKey, PeerRecord>,
    connecting: HashMap<PeerKey, Instant>, // key -> attempt deadline
    banned: HashSet<PeerKey>,
    backoff: BackoffPolicy,
}

impl Swarm {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            peers: HashMap::new(),
            connecting: HashMap::new(),
            banned: HashSet::new(),
            backoff,
        }
    }

    /// Adds a newly discovered peer. Known and banned keys are left alone,
    /// so repeated announces never reset backoff state.
    pub fn add_peer(&mut self, key: PeerKey, source: PeerSource) -> bool {
        if self.banned.contains(&key) || self.peers.contains_key(&key) {
            return false;
        }
        self.peers.insert(key, PeerRecord::new(key, source));
        event!(Level::DEBUG, peer = %key, %source, "Peer discovered");
        true
    }

    pub fn get(&self, key: &PeerKey) -> Option<&PeerRecord> {
        self.peers.get(key)
    }

    pub fn get_mut(&mut self, key: &PeerKey) -> Option<&mut PeerRecord> {
        self.peers.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_connecting(&self, key: &PeerKey) -> bool {
        self.connecting.contains_key(key)
    }

    pub fn count_connecting(&self) -> usize {
        self.connecting.len()
    }

    pub fn count_connected(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .count()
    }

    /// Connected peers in key order.
    pub fn connected_keys(&self) -> Vec<PeerKey> {
        let mut keys: Vec<PeerKey> = self
            .peers
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(PeerRecord::key)
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Earliest time the peer may be dialled again, or `None` if it may be
    /// dialled right away.
    pub fn next_eligible_at(&self, key: &PeerKey) -> Option<Instant> {
        let record = self.peers.get(key)?;
        record
            .last_connect_attempt
            .map(|at| at + self.backoff.delay(record.connect_failures))
    }

    pub fn mark_connect_attempt_started(
        &mut self,
        key: PeerKey,
        now: Instant,
        deadline: Instant,
    ) -> Result<(), SwarmError> {
        if self.connecting.contains_key(&key) {
            return Err(SwarmError::AlreadyConnecting(key));
        }
        let record = self.peers.get_mut(&key).ok_or(SwarmError::UnknownPeer(key))?;
        match record.state {
            ConnectionState::Idle | ConnectionState::Failed => {}
            ConnectionState::Connecting => return Err(SwarmError::AlreadyConnecting(key)),
            state => {
                return Err(SwarmError::InvalidTransition {
                    key,
                    state: state.name(),
                    action: "start a connect attempt",
                });
            }
        }

        record.state = ConnectionState::Connecting;
        record.last_connect_attempt = Some(now);
        self.connecting.insert(key, deadline);
        event!(
            Level::DEBUG,
            peer = %key,
            failures = record.connect_failures,
            "Connecting to peer"
        );
        Ok(())
    }

    pub fn mark_connect_succeeded(&mut self, key: PeerKey, now: Instant) -> Result<(), SwarmError> {
        let record = self.peers.get_mut(&key).ok_or(SwarmError::UnknownPeer(key))?;
        if record.state != ConnectionState::Connecting {
            return Err(SwarmError::InvalidTransition {
                key,
                state: record.state.name(),
                action: "complete a connect attempt",
            });
        }
        self.connecting.remove(&key);
        record.state = ConnectionState::Connected;
        record.connected_at = Some(now);
        event!(Level::INFO, peer = %key, "Connected to peer");
        Ok(())
    }

    /// Records a failed attempt. The in-flight entry is removed first and
    /// unconditionally; returns whether a connecting record was transitioned.
    pub fn mark_connect_failed(
        &mut self,
        key: PeerKey,
        reason: &ConnectFailure,
        now: Instant,
    ) -> bool {
        self.connecting.remove(&key);

        let Some(record) = self.peers.get_mut(&key) else {
            return false;
        };
        if record.state != ConnectionState::Connecting {
            return false;
        }
        record.state = ConnectionState::Failed;
        record.connect_failures = record.connect_failures.saturating_add(1);
        record.last_connect_attempt = Some(now);
        event!(
            Level::DEBUG,
            peer = %key,
            %reason,
            failures = record.connect_failures,
            backoff_ms = self.backoff.delay(record.connect_failures).as_millis() as u64,
            "Connect attempt failed"
        );
        true
    }

    /// Ends an established connection. Error disconnects follow the failure
    /// path, and so does a graceful close of a session that never delivered
    /// a block. Other graceful closes return the peer to idle with its
    /// history intact.
    pub fn mark_disconnected(
        &mut self,
        key: PeerKey,
        reason: &DisconnectReason,
        now: Instant,
    ) -> Result<(), SwarmError> {
        let record = self.peers.get_mut(&key).ok_or(SwarmError::UnknownPeer(key))?;
        if record.state != ConnectionState::Connected {
            return Err(SwarmError::InvalidTransition {
                key,
                state: record.state.name(),
                action: "disconnect",
            });
        }

        let lasted_ms = record
            .connected_at
            .map(|at| now.saturating_duration_since(at).as_millis() as u64);
        let unproductive = record.blocks_received == 0;
        record.state = ConnectionState::Disconnected;
        record.reset_session();
        if reason.is_failure() || unproductive {
            record.state = ConnectionState::Failed;
            record.connect_failures = record.connect_failures.saturating_add(1);
            record.last_connect_attempt = Some(now);
        } else {
            record.state = ConnectionState::Idle;
        }
        event!(
            Level::DEBUG,
            peer = %key,
            %reason,
            unproductive,
            lasted_ms,
            failures = record.connect_failures,
            "Peer disconnected"
        );
        Ok(())
    }

    /// Counts a delivered block and clears failure history.
    pub fn mark_productive(&mut self, key: &PeerKey) {
        if let Some(record) = self.peers.get_mut(key) {
            record.blocks_received += 1;
            if record.connect_failures > 0 {
                event!(Level::TRACE, peer = %key, "Resetting failure count after useful data");
                record.connect_failures = 0;
            }
        }
    }

    /// Peers that may be dialled at `now`, at most `limit` of them.
    ///
    /// Backoff is measured from the last attempt whatever the current state,
    /// so a peer that drifted back to idle still waits out its delay.
    pub fn get_connectable_peers(&self, limit: usize, now: Instant) -> Vec<PeerKey> {
        if limit == 0 {
            return Vec::new();
        }

        let mut eligible: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|p| matches!(p.state, ConnectionState::Idle | ConnectionState::Failed))
            .filter(|p| !self.connecting.contains_key(&p.key()))
            .filter(|p| match p.last_connect_attempt {
                Some(at) => now >= at + self.backoff.delay(p.connect_failures),
                None => true,
            })
            .collect();

        eligible.sort_by(|a, b| {
            a.connect_failures
                .cmp(&b.connect_failures)
                .then(a.last_connect_attempt.cmp(&b.last_connect_attempt))
                .then(a.key().cmp(&b.key()))
        });
        eligible.into_iter().take(limit).map(PeerRecord::key).collect()
    }

    /// In-flight attempts whose deadline has passed.
    pub fn expired_attempts(&self, now: Instant) -> Vec<PeerKey> {
        let mut expired: Vec<PeerKey> = self
            .connecting
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| *key)
            .collect();
        expired.sort_unstable();
        expired
    }

    /// Destroys a record, e.g. when the torrent is removed.
    pub fn evict(&mut self, key: &PeerKey) -> Option<PeerRecord> {
        self.connecting.remove(key);
        self.peers.remove(key)
    }

    /// Evicts a peer and refuses to re-add it.
    pub fn ban(&mut self, key: PeerKey) -> Option<PeerRecord> {
        self.banned.insert(key);
        event!(Level::INFO, peer = %key, "Peer banned");
        self.evict(&key)
    }

    pub fn is_banned(&self, key: &PeerKey) -> bool {
        self.banned.contains(key)
    }

    pub fn stats(&self) -> SwarmStats {
        let mut stats = SwarmStats {
            total: self.peers.len(),
            banned: self.banned.len(),
            ..SwarmStats::default()
        };
        for record in self.peers.values() {
            match record.state {
                ConnectionState::Idle | ConnectionState::Disconnected => stats.idle += 1,
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Failed => stats.failed += 1,
            }
            *stats.by_source.entry(record.source).or_default() += 1;
        }
        stats
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }
}

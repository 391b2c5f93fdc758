use crate::peer::{ConnectFailure, DisconnectReason, Outbound, PeerKey, PeerMessage, PeerSource};

/// Inputs to the orchestrator. Queued as they arrive and applied in order on
/// the next effective tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeersDiscovered(Vec<(PeerKey, PeerSource)>),
    ConnectSucceeded(PeerKey),
    ConnectFailed(PeerKey, ConnectFailure),
    Disconnected(PeerKey, DisconnectReason),
    Message(PeerKey, PeerMessage),
    /// The storage integrity scan found a verified piece whose bytes no longer match.
    CorruptionDetected(u32),
}

/// Work the orchestrator asks its environment to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Effect {
    /// Begin an asynchronous connect attempt.
    Connect(PeerKey),
    Send(PeerKey, Outbound),
    /// Close the session with this peer; the swarm has already been updated.
    Disconnect(PeerKey),
    PieceVerified(u32),
    PieceFailed(u32),
    /// A verified piece was found corrupted and is missing again.
    PieceLost(u32),
    /// Every piece is verified.
    Completed,
}

use std::fmt;
use std::net::SocketAddr;

pub mod message;
pub mod record;
pub mod swarm;

pub use message::{Outbound, PeerMessage};
pub use record::{ConnectionState, PeerRecord};
pub use swarm::{Swarm, SwarmStats};

/// Stable identity of a remote peer within one torrent's swarm.
pub type PeerKey = SocketAddr;

/// How a peer was discovered. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Manual,
}

impl fmt::Display for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerSource::Tracker => "tracker",
            PeerSource::Dht => "dht",
            PeerSource::Pex => "pex",
            PeerSource::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Why a connect attempt did not produce a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    Refused,
    Timeout,
    Handshake(String),
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::Refused => f.write_str("refused"),
            ConnectFailure::Timeout => f.write_str("timeout"),
            ConnectFailure::Handshake(reason) => write!(f, "handshake failed: {reason}"),
        }
    }
}

/// Why an established connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly close, e.g. the download finished or we dropped the peer.
    Graceful,
    /// Transport error or the remote end hung up unexpectedly.
    Error(String),
    /// The peer sent something malformed.
    ProtocolViolation(String),
}

impl DisconnectReason {
    /// Whether this disconnect counts against the peer like a connect failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, DisconnectReason::Graceful)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Graceful => f.write_str("graceful"),
            DisconnectReason::Error(reason) => write!(f, "error: {reason}"),
            DisconnectReason::ProtocolViolation(reason) => {
                write!(f, "protocol violation: {reason}")
            }
        }
    }
}

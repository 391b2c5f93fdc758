use std::net::SocketAddr;

use thiserror::Error;

/// Contract violations reported by the peer registry.
///
/// These never come from the network; they mean the caller skipped the
/// eligibility check or raced its own bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SwarmError {
    /// No record exists for the key.
    #[error("unknown peer {0}")]
    UnknownPeer(SocketAddr),

    /// A connect attempt is already in flight for the key.
    #[error("connect attempt already in flight for {0}")]
    AlreadyConnecting(SocketAddr),

    /// The requested transition is not allowed from the record's current state.
    #[error("peer {key}: cannot {action} while {state}")]
    InvalidTransition {
        key: SocketAddr,
        state: &'static str,
        action: &'static str,
    },
}

/// Errors raised by the completion bitfield.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PieceError {
    #[error("piece index {index} out of range (piece count {count})")]
    OutOfRange { index: u32, count: u32 },
}

/// Errors from the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block {index}:{offset}+{len} exceeds piece length {piece_length}")]
    OutOfBounds {
        index: u32,
        offset: u32,
        len: usize,
        piece_length: u32,
    },

    #[error("piece {0} has no stored data")]
    Missing(u32),
}

/// Errors from the peer transport collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused")]
    Refused,

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Invalid engine configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("block size {0} exceeds the 128 KiB request limit")]
    BlockTooLarge(u32),
}

/// Aggregate error for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error(transparent)]
    Piece(#[from] PieceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The download task is no longer running.
    #[error("download task has stopped")]
    Stopped,
}

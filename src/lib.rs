pub mod config;
pub mod discovery;
pub mod download;
pub mod error;
pub mod loopback;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;
pub mod transport;

// Re-export commonly used types for easier access
pub use config::{BackoffPolicy, EngineConfig};
pub use download::{Command, Download, DownloadHandle, Effect, Event, Notification};
pub use error::EngineError;
pub use peer::{PeerKey, PeerSource};
pub use piece::{Bitfield, BlockRequest};
pub use storage::{MemoryStorage, PieceStorage};
pub use torrent::{Metainfo, TorrentMetadata};

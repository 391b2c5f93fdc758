use crate::piece::BlockRequest;

/// Decoded message received from a connected peer.
///
/// Framing and byte layout belong to the wire codec; the engine only sees
/// these already-parsed forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Choke,
    Unchoke,
    Have(u32),
    /// Raw bitfield payload, MSB first.
    Bitfield(Vec<u8>),
    Piece {
        index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    /// The peer refused a request (fast extension reject).
    Reject(BlockRequest),
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Have(_) => "have",
            PeerMessage::Bitfield(_) => "bitfield",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Reject(_) => "reject",
        }
    }
}

/// Message the engine asks the transport to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Interested,
    NotInterested,
    Request(BlockRequest),
    Cancel(BlockRequest),
    Have(u32),
}

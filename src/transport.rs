use std::future::Future;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::peer::{DisconnectReason, Outbound, PeerKey, PeerMessage};

/// What a transport reports about a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Message(PeerMessage),
    Closed(DisconnectReason),
}

pub type InboundSender = mpsc::UnboundedSender<(PeerKey, WireEvent)>;
pub type InboundReceiver = mpsc::UnboundedReceiver<(PeerKey, WireEvent)>;

/// Sending half of an established peer connection.
#[derive(Debug, Clone)]
pub struct PeerLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerLink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Creates a link and the receiver the transport reads outbound messages from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, message: Outbound) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Establishes peer-wire sessions (TCP/uTP, handshake, encryption).
///
/// Once `connect` resolves, the transport reports decoded messages and the
/// eventual close through `inbound`. Dropping the returned link asks the
/// transport to close the session.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        key: PeerKey,
        inbound: InboundSender,
    ) -> impl Future<Output = Result<PeerLink, TransportError>> + Send;
}

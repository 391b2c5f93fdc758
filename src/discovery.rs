use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::peer::PeerSource;

/// A source of candidate peer addresses (tracker, DHT, PEX, manual hints).
///
/// Polled by the download task on every tick. Returning an address more than
/// once is harmless; the swarm deduplicates by key.
pub trait PeerDiscovery: Send {
    fn discovered_peers(&mut self) -> Vec<(SocketAddr, PeerSource)>;
}

/// Fixed list of peers handed over on the first poll, e.g. magnet `x.pe` hints.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<(SocketAddr, PeerSource)>,
}

impl StaticDiscovery {
    pub fn new(peers: impl IntoIterator<Item = SocketAddr>, source: PeerSource) -> Self {
        Self {
            peers: peers.into_iter().map(|addr| (addr, source)).collect(),
        }
    }
}

impl PeerDiscovery for StaticDiscovery {
    fn discovered_peers(&mut self) -> Vec<(SocketAddr, PeerSource)> {
        std::mem::take(&mut self.peers)
    }
}

/// Receives addresses pushed by a background task such as a tracker announcer.
#[derive(Debug)]
pub struct ChannelDiscovery {
    rx: mpsc::UnboundedReceiver<(SocketAddr, PeerSource)>,
}

impl ChannelDiscovery {
    pub fn new() -> (mpsc::UnboundedSender<(SocketAddr, PeerSource)>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

impl PeerDiscovery for ChannelDiscovery {
    fn discovered_peers(&mut self) -> Vec<(SocketAddr, PeerSource)> {
        let mut peers = Vec::new();
        while let Ok(peer) = self.rx.try_recv() {
            peers.push(peer);
        }
        peers
    }
}

//! In-process peers for running the engine without a network.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng as _;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{Level, event};

use crate::error::TransportError;
use crate::peer::{DisconnectReason, Outbound, PeerKey, PeerMessage};
use crate::piece::{Bitfield, BlockRequest};
use crate::transport::{Connector, InboundSender, PeerLink, WireEvent};

/// How a simulated peer treats us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Has every piece and serves every request.
    Seeder,
    /// Actively refuses connections.
    Refuse,
    /// Never answers the connect, so the attempt times out.
    Blackhole,
    /// Has every piece but serves flipped bytes.
    Corrupt,
    /// Accepts the connection and drops it straight away.
    HangUp,
    /// Accepts the connection and closes it cleanly without sending anything.
    Leave,
}

/// A set of simulated peers sharing one torrent's content.
#[derive(Debug)]
pub struct LoopbackSwarm {
    content: Arc<Vec<u8>>,
    piece_length: u32,
    peers: HashMap<PeerKey, Behaviour>,
    latency: (Duration, Duration),
    attempts: Mutex<HashMap<PeerKey, Vec<Instant>>>,
}

impl LoopbackSwarm {
    pub fn new(content: Vec<u8>, piece_length: u32) -> Self {
        LoopbackSwarm {
            content: Arc::new(content),
            piece_length: piece_length.max(1),
            peers: HashMap::new(),
            latency: (Duration::ZERO, Duration::ZERO),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Each connect and each served block waits a random time in `min..=max`.
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = (min, max.max(min));
        self
    }

    pub fn with_peer(mut self, key: PeerKey, behaviour: Behaviour) -> Self {
        self.peers.insert(key, behaviour);
        self
    }

    pub fn peers(&self) -> impl Iterator<Item = (&PeerKey, &Behaviour)> {
        self.peers.iter()
    }

    /// When connects to `key` were started, oldest first.
    pub fn attempts(&self, key: &PeerKey) -> Vec<Instant> {
        match self.attempts.lock() {
            Ok(log) => log.get(key).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn piece_count(&self) -> u32 {
        (self.content.len() as u64).div_ceil(self.piece_length as u64) as u32
    }

    fn sample_latency(&self) -> Duration {
        let (min, max) = self.latency;
        if max.is_zero() {
            return Duration::ZERO;
        }
        let micros = rand::rng().random_range(min.as_micros() as u64..=max.as_micros() as u64);
        Duration::from_micros(micros)
    }

    fn record_attempt(&self, key: PeerKey) {
        if let Ok(mut log) = self.attempts.lock() {
            log.entry(key).or_default().push(Instant::now());
        }
    }
}

impl Connector for LoopbackSwarm {
    fn connect(
        &self,
        key: PeerKey,
        inbound: InboundSender,
    ) -> impl Future<Output = Result<PeerLink, TransportError>> + Send {
        self.record_attempt(key);
        let behaviour = self.peers.get(&key).copied();
        let delay = self.sample_latency();
        let peer = SimulatedPeer {
            key,
            content: Arc::clone(&self.content),
            piece_length: self.piece_length,
            piece_count: self.piece_count(),
            latency: delay,
        };

        async move {
            sleep(delay).await;
            match behaviour {
                None | Some(Behaviour::Refuse) => Err(TransportError::Refused),
                Some(Behaviour::Blackhole) => std::future::pending().await,
                Some(behaviour) => {
                    let (link, outbound) = PeerLink::channel();
                    tokio::spawn(peer.serve(behaviour, outbound, inbound));
                    Ok(link)
                }
            }
        }
    }
}

struct SimulatedPeer {
    key: PeerKey,
    content: Arc<Vec<u8>>,
    piece_length: u32,
    piece_count: u32,
    latency: Duration,
}

impl SimulatedPeer {
    async fn serve(
        self,
        behaviour: Behaviour,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        inbound: InboundSender,
    ) {
        let key = self.key;
        if matches!(behaviour, Behaviour::HangUp | Behaviour::Leave) {
            sleep(self.latency).await;
            let reason = match behaviour {
                Behaviour::Leave => DisconnectReason::Graceful,
                _ => DisconnectReason::Error("connection reset by peer".to_string()),
            };
            let _ = inbound.send((key, WireEvent::Closed(reason)));
            return;
        }

        let have = Bitfield::full(self.piece_count);
        let bitfield = PeerMessage::Bitfield(have.as_bytes().to_vec());
        let _ = inbound.send((key, WireEvent::Message(bitfield)));
        let _ = inbound.send((key, WireEvent::Message(PeerMessage::Unchoke)));

        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Request(request) => {
                    sleep(self.latency).await;
                    let reply = match self.block(&request) {
                        Some(mut data) => {
                            if behaviour == Behaviour::Corrupt {
                                data.iter_mut().for_each(|b| *b ^= 0x5A);
                            }
                            PeerMessage::Piece {
                                index: request.piece_index,
                                offset: request.offset,
                                data,
                            }
                        }
                        None => PeerMessage::Reject(request),
                    };
                    if inbound.send((key, WireEvent::Message(reply))).is_err() {
                        return;
                    }
                }
                Outbound::Interested
                | Outbound::NotInterested
                | Outbound::Cancel(_)
                | Outbound::Have(_) => {}
            }
        }

        // The engine dropped its link.
        event!(Level::TRACE, peer = %key, "Simulated peer closing");
        let _ = inbound.send((key, WireEvent::Closed(DisconnectReason::Graceful)));
    }

    fn block(&self, request: &BlockRequest) -> Option<Vec<u8>> {
        if request.offset.checked_add(request.length)? > self.piece_length {
            return None;
        }
        let start = request.piece_index as u64 * self.piece_length as u64 + request.offset as u64;
        let end = start + request.length as u64;
        self.content
            .get(start as usize..end as usize)
            .map(<[u8]>::to_vec)
    }
}

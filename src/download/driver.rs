use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tracing::{Level, event};

use crate::discovery::PeerDiscovery;
use crate::download::{Download, Effect, Event};
use crate::error::{EngineError, TransportError};
use crate::peer::{ConnectFailure, PeerKey, PeerSource};
use crate::storage::PieceStorage;
use crate::torrent::TorrentMetadata;
use crate::transport::{Connector, InboundReceiver, InboundSender, PeerLink, WireEvent};

const NOTIFICATION_CAPACITY: usize = 256;

/// Requests accepted by a running download task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddPeer(PeerKey, PeerSource),
    /// Drop a peer and never dial it again.
    Ban(PeerKey),
    /// A verified piece was found damaged on disk.
    CorruptionDetected(u32),
    /// Re-verify every complete piece against storage.
    Recheck,
    Shutdown,
}

/// Progress reported by a running download task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PieceVerified(u32),
    PieceFailed(u32),
    PieceLost(u32),
    /// Pieces cleared by a recheck.
    Rechecked(Vec<u32>),
    Completed,
}

/// Cloneable handle to a download task. Dropping every handle stops the task.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    commands: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl DownloadHandle {
    pub fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }

    pub fn add_peer(&self, key: PeerKey, source: PeerSource) -> Result<(), EngineError> {
        self.send(Command::AddPeer(key, source))
    }

    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.send(Command::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

/// Starts the download task. The join handle yields the download back once
/// the task stops, so its final state can be inspected.
pub fn spawn<M, S, C>(
    download: Download<M, S>,
    connector: Arc<C>,
    discovery: Vec<Box<dyn PeerDiscovery>>,
) -> (DownloadHandle, JoinHandle<Download<M, S>>)
where
    M: TorrentMetadata + Send + 'static,
    S: PieceStorage + Send + 'static,
    C: Connector,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
    let handle = DownloadHandle {
        commands: command_tx,
        notifications: notify_tx.clone(),
    };
    let task = tokio::spawn(run(download, connector, discovery, command_rx, notify_tx));
    (handle, task)
}

/// Owns the download for its whole life. Connect attempts and sessions run
/// as separate tasks and only ever talk back through channels.
pub async fn run<M, S, C>(
    mut download: Download<M, S>,
    connector: Arc<C>,
    mut discovery: Vec<Box<dyn PeerDiscovery>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    notifications: broadcast::Sender<Notification>,
) -> Download<M, S>
where
    M: TorrentMetadata,
    S: PieceStorage,
    C: Connector,
{
    let (inbound_tx, mut inbound_rx): (InboundSender, InboundReceiver) = mpsc::unbounded_channel();
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ConnectResult>();
    let mut session = Session {
        connector,
        inbound_tx,
        result_tx,
        links: HashMap::new(),
        notifications,
        connect_timeout: download.config().connect_timeout,
    };

    let period = download.config().tick_interval.max(Duration::from_millis(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    event!(Level::INFO, pieces = download.bitfield().total_count(), "Download task started");

    loop {
        tokio::select! {
            // Scheduled instant; runs stay a full interval apart.
            at = ticker.tick() => {
                for source in discovery.iter_mut() {
                    let peers = source.discovered_peers();
                    if !peers.is_empty() {
                        download.push_event(Event::PeersDiscovered(peers));
                    }
                }
                let effects = download.tick(at.into_std());
                for effect in effects {
                    session.apply(effect);
                }
            }

            command = commands.recv() => match command {
                Some(Command::AddPeer(key, source)) => {
                    download.add_peer(key, source);
                }
                Some(Command::Ban(key)) => {
                    download.ban_peer(key, Instant::now().into_std());
                }
                Some(Command::CorruptionDetected(index)) => {
                    download.push_event(Event::CorruptionDetected(index));
                }
                Some(Command::Recheck) => {
                    let cleared = download.recheck();
                    session.notify(Notification::Rechecked(cleared));
                }
                Some(Command::Shutdown) | None => break,
            },

            Some((key, result)) = result_rx.recv() => match result {
                Ok(link) => {
                    session.links.insert(key, link);
                    download.push_event(Event::ConnectSucceeded(key));
                }
                Err(e) => download.push_event(Event::ConnectFailed(key, connect_failure(e))),
            },

            Some((key, wire)) = inbound_rx.recv() => match wire {
                WireEvent::Message(message) => download.push_event(Event::Message(key, message)),
                WireEvent::Closed(reason) => {
                    session.links.remove(&key);
                    download.push_event(Event::Disconnected(key, reason));
                }
            },
        }
    }

    event!(
        Level::INFO,
        completed = download.bitfield().completed_count(),
        total = download.bitfield().total_count(),
        "Download task stopped"
    );
    download
}

fn connect_failure(error: TransportError) -> ConnectFailure {
    match error {
        TransportError::Refused => ConnectFailure::Refused,
        TransportError::Timeout => ConnectFailure::Timeout,
        TransportError::Closed => ConnectFailure::Handshake("closed during handshake".to_string()),
        TransportError::Protocol(reason) => ConnectFailure::Handshake(reason),
    }
}

type ConnectResult = (PeerKey, Result<PeerLink, TransportError>);

/// The I/O side of the task: live links and the channels spawned work reports on.
struct Session<C> {
    connector: Arc<C>,
    inbound_tx: InboundSender,
    result_tx: mpsc::UnboundedSender<ConnectResult>,
    links: HashMap<PeerKey, PeerLink>,
    notifications: broadcast::Sender<Notification>,
    connect_timeout: Duration,
}

impl<C: Connector> Session<C> {
    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Connect(key) => self.connect(key),
            Effect::Send(key, message) => {
                let Some(link) = self.links.get(&key) else {
                    event!(Level::TRACE, peer = %key, "No link for outbound message");
                    return;
                };
                if let Err(e) = link.send(message) {
                    // The transport reports the close itself; just stop using the link.
                    event!(Level::DEBUG, peer = %key, error = %e, "Outbound message dropped");
                    self.links.remove(&key);
                }
            }
            Effect::Disconnect(key) => {
                if self.links.remove(&key).is_some() {
                    event!(Level::DEBUG, peer = %key, "Closing session");
                }
            }
            Effect::PieceVerified(index) => self.notify(Notification::PieceVerified(index)),
            Effect::PieceFailed(index) => self.notify(Notification::PieceFailed(index)),
            Effect::PieceLost(index) => self.notify(Notification::PieceLost(index)),
            Effect::Completed => self.notify(Notification::Completed),
        }
    }

    fn connect(&self, key: PeerKey) {
        let connector = Arc::clone(&self.connector);
        let inbound = self.inbound_tx.clone();
        let results = self.result_tx.clone();
        let limit = self.connect_timeout;

        tokio::spawn(async move {
            let result = match timeout(limit, connector.connect(key, inbound)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            if results.send((key, result)).is_err() {
                event!(Level::TRACE, peer = %key, "Download task gone before connect finished");
            }
        });
    }

    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }
}

//! Ephemeral session servers.
//!
//! Each session is an actor: one task owns its listener, its client set, its
//! behaviour ([`SessionLogic`]) and, for games, the tick timer. Connection
//! tasks never touch that state directly; they forward [`SessionEvent`]s to the
//! actor and drain their own outbound queue into the socket, so every
//! recipient sees broadcasts in the order the actor enqueued them.
//!
//! Outbound queues are bounded. A client that falls [`OUTBOUND_CAPACITY`]
//! messages behind, or whose socket stalls a write for longer than
//! [`WRITE_TIMEOUT`], is dropped from the session.

use crate::registry::{SessionHandle, SessionStats};
use log::{debug, info, warn};
use serde_json::Value;
use shared::protocol::is_close_message;
use shared::{ChannelConfig, ChannelEvent, FramedChannel, ProtocolError, SessionKind};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

pub type ClientId = u32;

/// Largest step the simulation may take after a stall, in seconds
const MAX_DELTA_TIME: f32 = 0.05;

/// Messages queued for one client before it counts as dead
pub const OUTBOUND_CAPACITY: usize = 256;

/// Longest a single write to a client may block
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub type Outbound = mpsc::Sender<Value>;

/// Creates the queue the session actor uses to reach one client.
pub fn outbound_queue() -> (Outbound, mpsc::Receiver<Value>) {
    mpsc::channel(OUTBOUND_CAPACITY)
}

/// Connection-task to session-actor traffic
#[derive(Debug)]
pub enum SessionEvent {
    Joined {
        id: ClientId,
        peer: SocketAddr,
        outbound: Outbound,
    },
    Message {
        id: ClientId,
        value: Value,
    },
    Left {
        id: ClientId,
    },
}

#[derive(Debug)]
pub struct ClientConnection {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub display_name: Option<String>,
    outbound: Outbound,
}

impl ClientConnection {
    fn enqueue(&self, message: Value) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Client {} at {} is not keeping up, dropping it", self.id, self.peer);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Clients connected to one session, in join order.
#[derive(Debug, Default)]
pub struct ClientSet {
    clients: BTreeMap<ClientId, ClientConnection>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ClientId, peer: SocketAddr, outbound: Outbound) {
        self.clients.insert(
            id,
            ClientConnection {
                id,
                peer,
                display_name: None,
                outbound,
            },
        );
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientConnection> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&id)
    }

    pub fn peer(&self, id: ClientId) -> Option<SocketAddr> {
        self.clients.get(&id).map(|client| client.peer)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Queues `message` for one client. Returns false if it is gone or its
    /// queue is full, in which case it is removed.
    pub fn send_to(&mut self, id: ClientId, message: Value) -> bool {
        let delivered = match self.clients.get(&id) {
            Some(client) => client.enqueue(message),
            None => return false,
        };

        if !delivered {
            self.clients.remove(&id);
        }
        delivered
    }

    /// Queues `message` for every client. Dead or backed-up connections found
    /// during the pass are removed after it and their ids returned.
    pub fn broadcast(&mut self, message: &Value) -> Vec<ClientId> {
        let dead: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| !client.enqueue(message.clone()))
            .map(|client| client.id)
            .collect();

        for id in &dead {
            debug!("Dropping dead client {} after broadcast", id);
            self.clients.remove(id);
        }
        dead
    }
}

/// Behaviour plugged into the session actor.
pub trait SessionLogic: Send + 'static {
    fn kind(&self) -> SessionKind;

    fn on_join(&mut self, _clients: &mut ClientSet, _id: ClientId) {}

    fn on_message(&mut self, clients: &mut ClientSet, id: ClientId, message: Value);

    fn on_leave(&mut self, _clients: &mut ClientSet, _id: ClientId) {}

    /// Whether the actor should drive [`SessionLogic::tick`].
    fn ticks(&self) -> bool {
        false
    }

    fn tick(&mut self, _clients: &mut ClientSet, _dt: f32) {}

    /// Called once when the session is told to stop.
    fn on_shutdown(&mut self, _clients: &mut ClientSet) {}
}

/// State confined to the session actor
struct SessionCore<L> {
    id: u64,
    logic: L,
    clients: ClientSet,
    stats: Arc<SessionStats>,
}

impl<L: SessionLogic> SessionCore<L> {
    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Joined { id, peer, outbound } => {
                info!("Session {}: client {} joined from {}", self.id, id, peer);
                self.clients.insert(id, peer, outbound);
                self.logic.on_join(&mut self.clients, id);
            }
            SessionEvent::Message { id, value } => {
                if self.clients.get(id).is_some() {
                    self.logic.on_message(&mut self.clients, id, value);
                }
            }
            SessionEvent::Left { id } => {
                if self.clients.remove(id).is_some() {
                    info!("Session {}: client {} left", self.id, id);
                }
                self.logic.on_leave(&mut self.clients, id);
            }
        }
        self.stats.touch();
    }
}

/// Starts a session server on an already bound listener.
pub fn spawn<L: SessionLogic>(
    id: u64,
    listener: TcpListener,
    address: String,
    logic: L,
    channel_config: ChannelConfig,
    tick_period: Duration,
) -> std::io::Result<SessionHandle> {
    let port = listener.local_addr()?.port();
    let kind = logic.kind();
    let stats = Arc::new(SessionStats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let core = SessionCore {
        id,
        logic,
        clients: ClientSet::new(),
        stats: Arc::clone(&stats),
    };

    let task = tokio::spawn(run(core, listener, channel_config, tick_period, shutdown_rx));

    Ok(SessionHandle::new(
        id,
        kind,
        port,
        address,
        stats,
        shutdown_tx,
        task,
    ))
}

async fn run<L: SessionLogic>(
    mut core: SessionCore<L>,
    listener: TcpListener,
    channel_config: ChannelConfig,
    tick_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut next_client_id: ClientId = 1;

    let mut ticker = interval(tick_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();

    info!("Session {} ({}) serving", core.id, core.logic.kind());

    loop {
        let ticking = core.logic.ticks();

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let client_id = next_client_id;
                    next_client_id += 1;
                    debug!("Session {}: accepted {} as client {}", core.id, peer, client_id);
                    tokio::spawn(serve_connection(
                        client_id,
                        stream,
                        channel_config.clone(),
                        events_tx.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("Session {}: accept failed: {}", core.id, e),
            },

            Some(event) = events_rx.recv() => core.handle_event(event),

            _ = ticker.tick(), if ticking => {
                let now = Instant::now();
                let mut dt = now.duration_since(last_tick).as_secs_f32();
                last_tick = now;

                if dt > MAX_DELTA_TIME {
                    debug!("Session {}: large delta time {:.3}s, capping", core.id, dt);
                    dt = MAX_DELTA_TIME;
                }

                core.logic.tick(&mut core.clients, dt);
            }
        }

        core.stats.set_clients(core.clients.len());
    }

    core.logic.on_shutdown(&mut core.clients);
    info!("Session {} stopped", core.id);
    // Listener is dropped here, releasing the port
}

/// Owns one accepted connection: forwards inbound messages to the actor and
/// writes everything queued for this client.
async fn serve_connection(
    id: ClientId,
    stream: TcpStream,
    config: ChannelConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();
    let channel = match FramedChannel::accept(stream, config, channel_tx).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Failed to set up connection {}: {}", id, e);
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = outbound_queue();
    let joined = SessionEvent::Joined {
        id,
        peer: channel.peer_addr(),
        outbound: outbound_tx,
    };
    if events.send(joined).is_err() {
        channel.close().await;
        return;
    }

    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    if !deliver(id, &channel, &message, &mut shutdown).await {
                        break;
                    }
                }
                None => break,
            },

            event = channel_rx.recv() => match event {
                Some(ChannelEvent::Message(value)) => {
                    if is_close_message(&value) {
                        debug!("Client {} sent close", id);
                        break;
                    }
                    if events.send(SessionEvent::Message { id, value }).is_err() {
                        break;
                    }
                }
                Some(ChannelEvent::Malformed(e)) => {
                    debug!("Client {} sent a malformed frame: {}", id, e);
                    let reply = ProtocolError::InvalidJson.to_reply();
                    if !deliver(id, &channel, &reply, &mut shutdown).await {
                        break;
                    }
                }
                Some(ChannelEvent::Reconnected) => {}
                Some(ChannelEvent::Closed) | None => break,
            },
        }
    }

    channel.close().await;
    let _ = events.send(SessionEvent::Left { id });
}

/// Writes one message to a client. Gives up if the write fails, stalls past
/// [`WRITE_TIMEOUT`] or the session is told to stop first.
async fn deliver(
    id: ClientId,
    channel: &Arc<FramedChannel>,
    message: &Value,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        sent = timeout(WRITE_TIMEOUT, channel.send(message)) => match sent {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Client {} send failed: {}", id, e);
                false
            }
            Err(_) => {
                warn!("Client {} stalled a write for {:?}, disconnecting", id, WRITE_TIMEOUT);
                false
            }
        },
        _ = shutdown.changed() => false,
    }
}

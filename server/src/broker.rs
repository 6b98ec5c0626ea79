//! The broker: stable entry point that creates, lists, joins and destroys
//! session servers.
//!
//! Clients speak control commands to the broker and are redirected to a
//! session's own endpoint; the broker never relays session traffic.

use crate::config::{BrokerConfig, ConfigError, PortMode};
use crate::echo::EchoSession;
use crate::game::PongSession;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use shared::protocol::{is_close_message, CreateReply, InfoReply, JoinReply, ListReply};
use shared::{BrokerCommand, ChannelEvent, FramedChannel, ProtocolError, SessionKind};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;

/// How long a stopping session may take to release its port
const STOP_GRACE: Duration = Duration::from_secs(2);
const REAPER_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind broker on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

fn kind_title(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Echo => "Echo",
        SessionKind::Game => "Game",
    }
}

fn into_reply<T: Serialize>(result: Result<T, ProtocolError>) -> Value {
    match result {
        Ok(reply) => serde_json::to_value(reply)
            .unwrap_or_else(|e| json!({ "error": format!("Failed to encode reply: {}", e) })),
        Err(e) => e.to_reply(),
    }
}

/// Command handling and the session registry, independent of any socket.
pub struct Broker {
    config: BrokerConfig,
    registry: Mutex<SessionRegistry>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(SessionRegistry::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Runs one control command and produces the reply to send back.
    pub async fn execute(&self, command: BrokerCommand) -> Value {
        match command {
            BrokerCommand::List => into_reply(Ok(self.list().await)),
            BrokerCommand::Create { kind } => {
                let kind = kind.unwrap_or(self.config.default_kind);
                into_reply(self.create(kind).await)
            }
            BrokerCommand::Join { server_id } => into_reply(self.join(server_id).await),
            BrokerCommand::Nuke => into_reply(Ok(self.nuke().await)),
            BrokerCommand::Message { message } => {
                info!("Message from client: {}", message);
                into_reply(Ok(InfoReply {
                    message: "Message received".to_string(),
                }))
            }
            BrokerCommand::Close => into_reply(Ok(InfoReply {
                message: "Closing connection".to_string(),
            })),
        }
    }

    fn session_port(&self, id: u64) -> Option<u16> {
        match self.config.port_mode {
            PortMode::Offset => u16::try_from(id - 1)
                .ok()
                .and_then(|offset| self.config.base_port.checked_add(offset)),
            PortMode::Ephemeral => Some(0),
        }
    }

    /// Starts a new session server and registers it.
    pub async fn create(&self, kind: SessionKind) -> Result<CreateReply, ProtocolError> {
        let mut registry = self.registry.lock().await;
        let id = registry.allocate_id();

        let port = self.session_port(id).ok_or_else(|| {
            warn!("No port available for session {}", id);
            ProtocolError::CreateFailed
        })?;

        let listener = TcpListener::bind((self.config.host.as_str(), port))
            .await
            .map_err(|e| {
                warn!("Failed to bind session {} on port {}: {}", id, port, e);
                ProtocolError::CreateFailed
            })?;
        let port = listener
            .local_addr()
            .map_err(|_| ProtocolError::CreateFailed)?
            .port();
        let address = self.config.session_address(port);

        let handle = self
            .spawn_session(id, kind, listener, address.clone())
            .map_err(|e| {
                error!("Failed to start session {}: {}", id, e);
                ProtocolError::CreateFailed
            })?;
        registry.insert(handle);

        Ok(CreateReply {
            message: format!("Created {} Server", kind_title(kind)),
            address,
            server_id: id,
        })
    }

    fn spawn_session(
        &self,
        id: u64,
        kind: SessionKind,
        listener: TcpListener,
        address: String,
    ) -> io::Result<SessionHandle> {
        let channel_config = self.config.channel_config();
        let tick_period = self.config.tick_period();

        match kind {
            SessionKind::Echo => session::spawn(
                id,
                listener,
                address,
                EchoSession::new(),
                channel_config,
                tick_period,
            ),
            SessionKind::Game => session::spawn(
                id,
                listener,
                address,
                PongSession::new(self.config.win_score),
                channel_config,
                tick_period,
            ),
        }
    }

    pub async fn list(&self) -> ListReply {
        ListReply {
            servers: self.registry.lock().await.snapshot(),
        }
    }

    /// Looks up a session's endpoint. Never proxies.
    pub async fn join(&self, server_id: u64) -> Result<JoinReply, ProtocolError> {
        let registry = self.registry.lock().await;
        let handle = registry.get(server_id).ok_or(ProtocolError::ServerNotFound)?;

        Ok(JoinReply {
            message: format!("Joined {} Server {}", kind_title(handle.kind), server_id),
            address: handle.address.clone(),
            host: self.config.public_host.clone(),
            port: handle.port,
            server_id,
        })
    }

    /// Stops every session and clears the registry.
    pub async fn nuke(&self) -> InfoReply {
        let stopped = self.stop_all().await;
        info!("Nuked {} sessions", stopped);
        InfoReply {
            message: "All servers nuked".to_string(),
        }
    }

    /// Returns the number of sessions stopped. The registry lock is held until
    /// every listener is released.
    async fn stop_all(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let handles = registry.drain();
        let count = handles.len();
        for handle in handles {
            handle.stop(STOP_GRACE).await;
        }
        count
    }

    /// Destroys empty sessions idle for at least `idle_timeout`.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> Vec<u64> {
        let mut registry = self.registry.lock().await;
        let idle = registry.idle_sessions(idle_timeout);

        for id in &idle {
            if let Some(handle) = registry.remove(*id) {
                info!("Reaping idle session {}", id);
                handle.stop(STOP_GRACE).await;
            }
        }
        idle
    }

    pub async fn shutdown(&self) {
        let stopped = self.stop_all().await;
        info!("Broker shut down, stopped {} sessions", stopped);
    }

    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

/// Listening broker: accept loop, one task per client and the idle reaper.
pub struct BrokerServer {
    broker: Arc<Broker>,
    listener: TcpListener,
}

impl BrokerServer {
    pub async fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BrokerError::Bind { addr, source })?;
        info!("Broker listening on {}", listener.local_addr()?);

        Ok(Self {
            broker: Arc::new(Broker::new(config)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Serves until `shutdown` flips to true, then stops every session.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        if let Some(idle_timeout) = self.broker.config().idle_timeout {
            spawn_idle_reaper(self.broker(), idle_timeout, shutdown.clone());
        }

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Broker accepted {}", peer);
                        tokio::spawn(serve_client(self.broker(), stream, shutdown.clone()));
                    }
                    Err(e) => warn!("Broker accept failed: {}", e),
                },
            }
        }

        self.broker.shutdown().await;
        Ok(())
    }
}

fn spawn_idle_reaper(broker: Arc<Broker>, idle_timeout: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = interval(REAPER_PERIOD);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let reaped = broker.reap_idle(idle_timeout).await;
                    if !reaped.is_empty() {
                        debug!("Reaped sessions {:?}", reaped);
                    }
                }
            }
        }
    });
}

async fn serve_client(broker: Arc<Broker>, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = match FramedChannel::accept(stream, broker.config().channel_config(), events_tx).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Failed to set up broker connection: {}", e);
            return;
        }
    };
    let peer = channel.peer_addr();
    info!("Client connected to broker from {}", peer);

    while !*shutdown.borrow() {
        let event = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            event = events.recv() => event,
        };

        let reply = match event {
            Some(ChannelEvent::Message(value)) => {
                if is_close_message(&value) {
                    debug!("{} sent close", peer);
                    break;
                }
                match BrokerCommand::parse(&value) {
                    Ok(command) => {
                        debug!("{} -> {:?}", peer, command);
                        broker.execute(command).await
                    }
                    Err(e) => e.to_reply(),
                }
            }
            Some(ChannelEvent::Malformed(e)) => {
                debug!("Malformed frame from {}: {}", peer, e);
                ProtocolError::InvalidJson.to_reply()
            }
            Some(ChannelEvent::Reconnected) => continue,
            Some(ChannelEvent::Closed) | None => break,
        };

        if let Err(e) = channel.send(&reply).await {
            debug!("Reply to {} failed: {}", peer, e);
            break;
        }
    }

    channel.close().await;
    info!("Client {} left the broker", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            port: 0,
            port_mode: PortMode::Ephemeral,
            ..BrokerConfig::default()
        }
    }

    fn port_of(address: &str) -> u16 {
        address.rsplit(':').next().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_ids_increase_and_list_shows_empty_sessions() {
        let broker = Broker::new(test_config());

        let first = broker.create(SessionKind::Echo).await.unwrap();
        let second = broker.create(SessionKind::Game).await.unwrap();
        assert_eq!(first.server_id, 1);
        assert_eq!(second.server_id, 2);
        assert_eq!(first.message, "Created Echo Server");
        assert!(first.address.starts_with("ws://127.0.0.1:"));

        let list = broker.list().await;
        assert_eq!(list.servers.len(), 2);
        assert_eq!(list.servers[0].clients, 0);
        assert_eq!(list.servers[0].kind, SessionKind::Echo);
        assert_eq!(list.servers[1].kind, SessionKind::Game);

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_returns_endpoint() {
        let broker = Broker::new(test_config());
        let created = broker.create(SessionKind::Echo).await.unwrap();

        let joined = broker.join(created.server_id).await.unwrap();
        assert_eq!(joined.address, created.address);
        assert_eq!(joined.port, port_of(&created.address));
        assert_eq!(joined.host, "127.0.0.1");
        assert_eq!(joined.message, format!("Joined Echo Server {}", created.server_id));

        assert_eq!(broker.join(99).await, Err(ProtocolError::ServerNotFound));

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_nuke_clears_and_releases_ports() {
        let broker = Broker::new(test_config());
        let created = broker.create(SessionKind::Echo).await.unwrap();
        let port = port_of(&created.address);

        let reply = broker.nuke().await;
        assert_eq!(reply.message, "All servers nuked");
        assert!(broker.list().await.servers.is_empty());
        assert_eq!(
            broker.join(created.server_id).await,
            Err(ProtocolError::ServerNotFound)
        );

        // Port is free again
        assert_ok!(TcpListener::bind(("127.0.0.1", port)).await);

        // Ids keep increasing after a nuke
        let next = broker.create(SessionKind::Echo).await.unwrap();
        assert_eq!(next.server_id, created.server_id + 1);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_creates_are_unique() {
        let broker = Arc::new(Broker::new(test_config()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move { broker.create(SessionKind::Echo).await })
            })
            .collect();

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for task in tasks {
            let reply = task.await.unwrap().unwrap();
            assert!(ids.insert(reply.server_id));
            assert!(ports.insert(port_of(&reply.address)));
        }

        assert_eq!(broker.session_count().await, 8);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_offset_ports_and_bind_failure() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_port = blocker.local_addr().unwrap().port();

        let broker = Broker::new(BrokerConfig {
            port: 0,
            base_port,
            ..BrokerConfig::default()
        });

        // Session 1 wants base_port, which is taken
        assert_eq!(
            broker.create(SessionKind::Echo).await,
            Err(ProtocolError::CreateFailed)
        );
        assert_eq!(
            broker.execute(BrokerCommand::Create { kind: None }).await,
            json!({"error": "Failed to create server"})
        );
        assert!(broker.list().await.servers.is_empty());
        drop(blocker);
    }

    #[tokio::test]
    async fn test_execute_replies() {
        let broker = Broker::new(test_config());

        assert_eq!(
            broker.execute(BrokerCommand::List).await,
            json!({"servers": []})
        );
        assert_eq!(
            broker
                .execute(BrokerCommand::Message {
                    message: json!("hello")
                })
                .await,
            json!({"message": "Message received"})
        );
        assert_eq!(
            broker.execute(BrokerCommand::Join { server_id: 5 }).await,
            json!({"error": "Server not found"})
        );

        let created = broker
            .execute(BrokerCommand::Create {
                kind: Some(SessionKind::Game),
            })
            .await;
        assert_eq!(created["server_id"], 1);
        assert_eq!(created["message"], "Created Game Server");

        assert_eq!(
            broker.execute(BrokerCommand::Nuke).await,
            json!({"message": "All servers nuked"})
        );
    }

    #[tokio::test]
    async fn test_reap_idle_removes_empty_sessions() {
        let broker = Broker::new(test_config());
        broker.create(SessionKind::Echo).await.unwrap();

        assert!(broker.reap_idle(Duration::from_secs(3600)).await.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.reap_idle(Duration::from_millis(10)).await, vec![1]);
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let result = BrokerServer::bind(BrokerConfig {
            tick_rate: 0,
            ..test_config()
        })
        .await;
        assert!(matches!(
            result,
            Err(BrokerError::Config(ConfigError::InvalidTickRate(0)))
        ));
    }
}

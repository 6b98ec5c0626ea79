use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::channel::{EventReceiver, DecodeError};
use shared::protocol::{
    is_close_message, CreateReply, GameEvent, InfoReply, JoinReply, ListReply, Reply, SessionInfo,
};
use shared::{BrokerCommand, ChannelConfig, ChannelError, ChannelEvent, FramedChannel, GameIntent, SessionKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default wait for a reply from the broker or a session
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Disconnected,
    /// The peer answered with `{"error": ...}`
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected reply: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid address '{0}'")]
    Address(String),
}

/// Splits `host:port` or `ws://host:port` into its parts.
pub fn parse_address(address: &str) -> Result<(String, u16), ClientError> {
    let trimmed = address
        .strip_prefix("ws://")
        .or_else(|| address.strip_prefix("wss://"))
        .unwrap_or(address)
        .trim_end_matches('/');

    let (host, port) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| ClientError::Address(address.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| ClientError::Address(address.to_string()))?;

    if host.is_empty() {
        return Err(ClientError::Address(address.to_string()));
    }
    Ok((host.to_string(), port))
}

/// One client-initiated Framed Channel plus its event queue.
pub struct Connection {
    channel: Arc<FramedChannel>,
    events: EventReceiver,
    reply_timeout: Duration,
}

impl Connection {
    pub async fn connect(host: &str, port: u16, config: ChannelConfig) -> Result<Self, ClientError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let channel = FramedChannel::connect(host, port, config, events_tx).await?;

        Ok(Self {
            channel,
            events,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub async fn send(&self, message: &Value) -> Result<(), ClientError> {
        self.channel.send(message).await?;
        Ok(())
    }

    /// Waits for the next message with no deadline.
    ///
    /// Returns `None` once the peer has closed the connection or a reconnect
    /// gave up. A lost stream is reconnected in the background and waited
    /// for. Malformed frames are logged and skipped.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.events.recv().await? {
                ChannelEvent::Message(message) if is_close_message(&message) => {
                    debug!("Peer at {} closed the connection", self.channel.peer_addr());
                    self.channel.close().await;
                    return None;
                }
                ChannelEvent::Message(message) => return Some(message),
                ChannelEvent::Malformed(e) => log_malformed(&e),
                ChannelEvent::Reconnected => info!("Reconnected to {}", self.channel.peer_addr()),
                ChannelEvent::Closed => return None,
            }
        }
    }

    /// Next message, bounded by the reply timeout.
    pub async fn next_message(&mut self) -> Result<Value, ClientError> {
        let deadline = self.reply_timeout;
        match timeout(deadline, self.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout(deadline)),
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

fn log_malformed(e: &DecodeError) {
    warn!("Skipping malformed frame: {}", e);
}

fn decode_reply<T: DeserializeOwned>(reply: Value) -> Result<T, ClientError> {
    match serde_json::from_value::<Reply<T>>(reply)? {
        Reply::Ok(payload) => Ok(payload),
        Reply::Error(e) => Err(ClientError::Server(e.error)),
    }
}

/// Request/response client for the broker's control commands.
pub struct BrokerClient {
    connection: Connection,
}

impl BrokerClient {
    pub async fn connect(host: &str, port: u16, config: ChannelConfig) -> Result<Self, ClientError> {
        let connection = Connection::connect(host, port, config).await?;
        info!("Connected to broker at {}:{}", host, port);
        Ok(Self { connection })
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.connection = self.connection.with_reply_timeout(reply_timeout);
        self
    }

    /// Sends one command and decodes its reply.
    pub async fn request<T: DeserializeOwned>(&mut self, command: &BrokerCommand) -> Result<T, ClientError> {
        debug!("Broker request {:?}", command);
        self.connection.send(&command.to_message()).await?;
        let reply = self.connection.next_message().await?;
        decode_reply(reply)
    }

    pub async fn list(&mut self) -> Result<Vec<SessionInfo>, ClientError> {
        let reply: ListReply = self.request(&BrokerCommand::List).await?;
        Ok(reply.servers)
    }

    pub async fn create(&mut self, kind: Option<SessionKind>) -> Result<CreateReply, ClientError> {
        self.request(&BrokerCommand::Create { kind }).await
    }

    pub async fn join(&mut self, server_id: u64) -> Result<JoinReply, ClientError> {
        self.request(&BrokerCommand::Join { server_id }).await
    }

    pub async fn nuke(&mut self) -> Result<InfoReply, ClientError> {
        self.request(&BrokerCommand::Nuke).await
    }

    pub async fn message(&mut self, text: &str) -> Result<InfoReply, ClientError> {
        self.request(&BrokerCommand::Message {
            message: Value::String(text.to_string()),
        })
        .await
    }

    /// Sends raw JSON and returns whatever comes back, errors included.
    pub async fn raw(&mut self, message: &Value) -> Result<Value, ClientError> {
        self.connection.send(message).await?;
        self.connection.next_message().await
    }

    pub async fn close(self) {
        self.connection.close().await;
    }
}

/// Client of an echo or game session server.
pub struct SessionClient {
    connection: Connection,
}

impl SessionClient {
    pub async fn connect(host: &str, port: u16, config: ChannelConfig) -> Result<Self, ClientError> {
        let connection = Connection::connect(host, port, config).await?;
        info!("Connected to session at {}:{}", host, port);
        Ok(Self { connection })
    }

    /// Connects to the endpoint a `join` reply points at.
    pub async fn join(reply: &JoinReply, config: ChannelConfig) -> Result<Self, ClientError> {
        Self::connect(&reply.host, reply.port, config).await
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.connection = self.connection.with_reply_timeout(reply_timeout);
        self
    }

    pub async fn send_message(&self, text: &str) -> Result<(), ClientError> {
        self.connection
            .send(&json!({ "command": "message", "message": text }))
            .await
    }

    pub async fn set_name(&self, name: &str) -> Result<(), ClientError> {
        self.connection
            .send(&json!({ "command": "set_name", "name": name }))
            .await
    }

    pub async fn send_intent(&self, intent: &GameIntent) -> Result<(), ClientError> {
        self.connection.send(&intent.to_message()).await
    }

    pub async fn send(&self, message: &Value) -> Result<(), ClientError> {
        self.connection.send(message).await
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.connection.recv().await
    }

    pub async fn next_message(&mut self) -> Result<Value, ClientError> {
        self.connection.next_message().await
    }

    /// Next classified game message, skipping anything unrecognised.
    pub async fn next_game_event(&mut self) -> Result<GameEvent, ClientError> {
        loop {
            let message = self.connection.next_message().await?;
            match GameEvent::from_message(message) {
                Some(event) => return Ok(event),
                None => debug!("Ignoring unrecognised game message"),
            }
        }
    }

    pub async fn close(self) {
        self.connection.close().await;
    }
}

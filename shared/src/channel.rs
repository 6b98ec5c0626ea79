//! Framed Channel: message-oriented communication over one TCP stream.
//!
//! The channel owns the write half of the socket behind an async mutex so a
//! frame is always written whole, and spawns a receive task that feeds the
//! read half through a [`FrameCodec`]. Decoded messages are delivered to the
//! owner as [`ChannelEvent`]s on an unbounded queue.
//!
//! Channels come in two flavours. A channel created with
//! [`FramedChannel::connect`] remembers its endpoint and recovers from a lost
//! stream (failed write, read error or unexpected EOF) by reconnecting in the
//! background. A channel wrapping an accepted stream
//! ([`FramedChannel::accept`]) is discarded when the peer goes away.

use crate::framing::{encode_frame, Delimiter, FrameCodec, FrameError, DEFAULT_MAX_FRAME_LEN};
use crate::protocol::{close_message, is_close_message};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const READ_BUFFER_SIZE: usize = 4096;

/// Tunables shared by both channel flavours
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub delimiter: Delimiter,
    pub max_frame_len: usize,
    /// Attempts made by `connect` before a transient error becomes fatal
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// Pause between closing and reconnecting
    pub reconnect_delay: Duration,
    /// How long `close` waits for the peer to acknowledge
    pub close_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Newline,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_attempts: 5,
            connect_retry_delay: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
        }
    }
}

impl ChannelConfig {
    pub fn with_delimiter(delimiter: Delimiter) -> Self {
        Self {
            delimiter,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("channel is closed")]
    Closed,
    #[error("accepted connections cannot reconnect")]
    NotReconnectable,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Why a received frame could not be turned into a message
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything the receive side reports to the channel's owner.
#[derive(Debug)]
pub enum ChannelEvent {
    Message(Value),
    /// A frame arrived but was not valid UTF-8 JSON; the stream continues
    Malformed(DecodeError),
    /// The channel is finished: the peer closed, the socket failed on an
    /// accepted channel, or a reconnect gave up
    Closed,
    Reconnected,
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Turns one raw frame into a JSON message.
pub fn decode_frame(frame: Result<String, FrameError>) -> Result<Value, DecodeError> {
    let text = frame?;
    Ok(serde_json::from_str(&text)?)
}

#[derive(Debug, Clone)]
enum Origin {
    Initiated { host: String, port: u16 },
    Accepted,
}

pub struct FramedChannel {
    origin: Origin,
    peer: SocketAddr,
    config: ChannelConfig,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
    reconnecting: AtomicBool,
    /// Set by the owner's `close`; a closed channel never reconnects on its own
    closed: AtomicBool,
    events: EventSender,
}

impl FramedChannel {
    /// Connects to `host:port` and starts the receive loop.
    pub async fn connect(
        host: &str,
        port: u16,
        config: ChannelConfig,
        events: EventSender,
    ) -> Result<Arc<Self>, ChannelError> {
        let stream = connect_with_retry(host, port, &config).await?;
        let peer = stream.peer_addr()?;

        let channel = Arc::new(Self::new(
            Origin::Initiated {
                host: host.to_string(),
                port,
            },
            peer,
            config,
            events,
        ));
        channel.attach(stream).await;

        info!("Connected to {}", peer);
        Ok(channel)
    }

    /// Wraps a stream handed out by a listener.
    pub async fn accept(
        stream: TcpStream,
        config: ChannelConfig,
        events: EventSender,
    ) -> Result<Arc<Self>, ChannelError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let channel = Arc::new(Self::new(Origin::Accepted, peer, config, events));
        channel.attach(stream).await;
        Ok(channel)
    }

    fn new(origin: Origin, peer: SocketAddr, config: ChannelConfig, events: EventSender) -> Self {
        Self {
            origin,
            peer,
            config,
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            active: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        }
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.active.store(true, Ordering::SeqCst);

        let codec = FrameCodec::with_max_frame_len(self.config.delimiter, self.config.max_frame_len);
        let handle = tokio::spawn(receive_loop(
            Arc::downgrade(self),
            reader,
            codec,
            self.events.clone(),
        ));

        if let Some(stale) = self.reader_task.lock().await.replace(handle) {
            stale.abort();
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn delimiter(&self) -> Delimiter {
        self.config.delimiter
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    fn is_initiated(&self) -> bool {
        matches!(self.origin, Origin::Initiated { .. })
    }

    /// Writes `message` as one frame.
    ///
    /// Encoding errors are returned as-is. A failed write on an initiated
    /// channel schedules a reconnect and returns `Ok`, as does a send while the
    /// stream is down and the owner has not closed the channel. On an accepted
    /// channel a failed write closes the channel and returns the error.
    pub async fn send<T: Serialize + ?Sized>(
        self: &Arc<Self>,
        message: &T,
    ) -> Result<(), ChannelError> {
        let frame = encode_frame(message, self.config.delimiter)?;

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write_all(&frame).await,
                None if self.is_initiated() && !self.closed.load(Ordering::SeqCst) => {
                    debug!("Send to {} while disconnected, reconnecting", self.peer);
                    self.spawn_reconnect();
                    return Ok(());
                }
                None => return Err(ChannelError::Closed),
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => match self.origin {
                Origin::Initiated { .. } => {
                    warn!("Send to {} failed ({}), reconnecting", self.peer, e);
                    self.spawn_reconnect();
                    Ok(())
                }
                Origin::Accepted => {
                    debug!("Send to {} failed: {}", self.peer, e);
                    self.close().await;
                    Err(e.into())
                }
            },
        }
    }

    /// Best-effort graceful shutdown. Safe to call any number of times.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.teardown().await;
    }

    async fn teardown(&self) {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        let writer = self.writer.lock().await.take();

        if let Some(mut writer) = writer {
            if was_active {
                if let Ok(marker) = encode_frame(&close_message(), self.config.delimiter) {
                    let _ = timeout(self.config.close_timeout, writer.write_all(&marker)).await;
                }
            }
            let _ = writer.shutdown().await;
        }

        let reader = self.reader_task.lock().await.take();
        if let Some(mut reader) = reader {
            // The peer acknowledges by closing its side, which ends the loop
            if timeout(self.config.close_timeout, &mut reader).await.is_err() {
                debug!("No close acknowledgement from {}", self.peer);
                reader.abort();
            }
        }
    }

    /// Closes, waits `reconnect_delay`, then connects to the same endpoint.
    ///
    /// A failed attempt is reported to the owner as [`ChannelEvent::Closed`].
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), ChannelError> {
        let (host, port) = match &self.origin {
            Origin::Initiated { host, port } => (host.clone(), *port),
            Origin::Accepted => return Err(ChannelError::NotReconnectable),
        };

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.closed.store(false, Ordering::SeqCst);
        self.teardown().await;
        sleep(self.config.reconnect_delay).await;

        let result = if self.closed.load(Ordering::SeqCst) {
            debug!("Channel to {}:{} closed while waiting to reconnect", host, port);
            Ok(())
        } else {
            match connect_with_retry(&host, port, &self.config).await {
                Ok(stream) => {
                    self.attach(stream).await;
                    info!("Reconnected to {}:{}", host, port);
                    let _ = self.events.send(ChannelEvent::Reconnected);
                    Ok(())
                }
                Err(e) => {
                    self.closed.store(true, Ordering::SeqCst);
                    let _ = self.events.send(ChannelEvent::Closed);
                    Err(e)
                }
            }
        };

        self.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.is_reconnecting() {
            return;
        }
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = channel.reconnect().await {
                error!("Reconnect failed: {}", e);
            }
        });
    }

    /// Called by the receive loop once the stream is finished. Returns whether
    /// the channel was still active, i.e. nobody closed it on purpose.
    async fn mark_closed(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        was_active
    }
}

async fn receive_loop(
    channel: Weak<FramedChannel>,
    mut reader: OwnedReadHalf,
    mut codec: FrameCodec,
    events: EventSender,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    // A peer that sent the termination marker is leaving on purpose
    let mut peer_said_close = false;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!("Peer closed the stream");
                break;
            }
            Ok(len) => {
                codec.extend(&buffer[..len]);
                while let Some(frame) = codec.next_frame() {
                    let event = match decode_frame(frame) {
                        Ok(message) => {
                            peer_said_close |= is_close_message(&message);
                            ChannelEvent::Message(message)
                        }
                        Err(e) => ChannelEvent::Malformed(e),
                    };
                    if events.send(event).is_err() {
                        // Nobody is listening any more
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Read failed: {}", e);
                break;
            }
        }
    }

    if let Some(channel) = channel.upgrade() {
        let was_active = channel.mark_closed().await;
        if peer_said_close {
            channel.closed.store(true, Ordering::SeqCst);
        }
        if channel.is_initiated() && !channel.closed.load(Ordering::SeqCst) {
            if was_active {
                warn!("Lost connection to {}, reconnecting", channel.peer);
                channel.spawn_reconnect();
                return;
            }
            if channel.is_reconnecting() {
                // The reconnect reports the outcome
                return;
            }
        }
    }
    let _ = events.send(ChannelEvent::Closed);
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

async fn connect_with_retry(
    host: &str,
    port: u16,
    config: &ChannelConfig,
) -> Result<TcpStream, ChannelError> {
    let addr = format!("{}:{}", host, port);
    let attempts = config.connect_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if is_transient(&e) && attempt < attempts => {
                debug!("Connect to {} attempt {} failed: {}", addr, attempt, e);
                sleep(config.connect_retry_delay).await;
            }
            Err(source) => return Err(ChannelError::Connection { addr, source }),
        }
    }
}

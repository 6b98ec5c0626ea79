//! # Session Broker Client Library
//!
//! Client side of the session broker: a request/response client for the
//! broker's control commands and a client for the echo and game sessions it
//! hands out. Both sit on a client-initiated Framed Channel, so a lost stream
//! (failed write or unexpected EOF) triggers a background reconnect instead of
//! an error. A close marker from the peer ends the connection for good.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - `BrokerClient`: `list`, `create`, `join`, `nuke` and `message`, each
//!   decoded into its typed reply or a `ClientError::Server` carrying the
//!   broker's error text
//! - `SessionClient`: echo messages, display names and game intents
//! - Address parsing for the `ws://host:port` strings the broker returns
//!
//! ### Game Module (`game`)
//! A `GameView` folded from the events a game session sends: assigned slot,
//! start signal, latest snapshot and the winner.
//!
//! ### Input Module (`input`)
//! Parsing of lines typed on stdin into chat messages or paddle intents.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{BrokerClient, SessionClient};
//! use shared::{ChannelConfig, SessionKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChannelConfig::default();
//!     let mut broker = BrokerClient::connect("127.0.0.1", 8765, config.clone()).await?;
//!
//!     let created = broker.create(Some(SessionKind::Echo)).await?;
//!     let joined = broker.join(created.server_id).await?;
//!
//!     let mut session = SessionClient::join(&joined, config).await?;
//!     session.send_message("hello").await?;
//!     println!("{}", session.next_message().await?);
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;

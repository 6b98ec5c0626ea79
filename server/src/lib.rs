//! # Session Broker Server Library
//!
//! This library provides the broker and the ephemeral session servers it
//! spawns. Clients talk to the broker over a Framed Channel to create, list,
//! join and destroy sessions, then connect straight to the session they were
//! given. The broker is never in the data path of an established session.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! The broker allocates process-unique session ids, chooses a port for each
//! new session (a fixed offset from a base port, or one picked by the OS),
//! starts the session server in its own task and records it in the registry.
//! `nuke`, the idle reaper and broker shutdown stop sessions and wait until
//! their listening sockets are released.
//!
//! ### Echo Sessions
//! Every message a member sends is relayed to all members, the sender
//! included, with its `message` field renamed to `echo`.
//!
//! ### Game Sessions
//! A two-player Pong simulation. Players claim a slot with `ask_name`; once
//! both slots are taken the session announces `game_start` and advances the
//! ball at a fixed tick, broadcasting the full state every tick.
//!
//! ## Architecture Design
//!
//! ### Actor-Confined Sessions
//! Each session server is a single task that owns its listener, its client
//! set, its behaviour and its tick timer. Connection tasks talk to it over an
//! unbounded queue, so the hot path needs no locks and broadcasts reach each
//! member in the order they were issued.
//!
//! ### Locked Registry
//! The registry lives behind one `tokio::sync::Mutex` owned by the broker.
//! `create`, `list`, `nuke` and the reaper serialize on it, which keeps ids
//! and ports unique under concurrent requests.
//!
//! ### Cooperative Shutdown
//! Sessions and connection tasks watch a `tokio::sync::watch` flag and stop
//! within one tick of it being raised.
//!
//! ## Module Organization
//!
//! - `config`: startup configuration and validation
//! - `registry`: session table, per-session stats and stop handles
//! - `session`: the session actor, connection tasks and the client set
//! - `echo`: echo session behaviour
//! - `game`: Pong state, simulation step, slot assignment and game sessions
//! - `broker`: command handling and the listening broker
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::broker::BrokerServer;
//! use server::config::BrokerConfig;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = BrokerServer::bind(BrokerConfig::default()).await?;
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     // Serves until the shutdown flag is raised, then stops every session
//!     server.run(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod echo;
pub mod game;
pub mod registry;
pub mod session;

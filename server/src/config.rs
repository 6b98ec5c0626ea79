//! Broker startup configuration and its validation.
//!
//! Values come from the command line (see `main.rs`). An invalid configuration
//! is one of the two fatal error classes: the broker refuses to start.

use shared::{ChannelConfig, Delimiter, SessionKind, DEFAULT_TICK_RATE};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How a new session's port is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortMode {
    /// `base_port + id - 1`
    #[default]
    Offset,
    /// Let the OS pick a free port
    Ephemeral,
}

impl fmt::Display for PortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortMode::Offset => write!(f, "offset"),
            PortMode::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

impl FromStr for PortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offset" => Ok(PortMode::Offset),
            "ephemeral" => Ok(PortMode::Ephemeral),
            other => Err(format!(
                "unknown port mode '{}', expected 'offset' or 'ephemeral'",
                other
            )),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("tick rate must be between 1 and 1000 Hz, got {0}")]
    InvalidTickRate(u32),
    #[error("max frame length must be at least {min} bytes, got {got}")]
    FrameLimitTooSmall { min: usize, got: usize },
    #[error("base port must be non-zero in offset mode")]
    ZeroBasePort,
    #[error("win score must be at least 1")]
    ZeroWinScore,
    #[error("idle timeout must be non-zero")]
    ZeroIdleTimeout,
}

/// Smallest frame limit that still fits every control message
const MIN_FRAME_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Interface the broker and its sessions bind to
    pub host: String,
    pub port: u16,
    /// Host written into session addresses handed to clients
    pub public_host: String,
    pub delimiter: Delimiter,
    pub max_frame_len: usize,
    pub port_mode: PortMode,
    pub base_port: u16,
    /// Kind used by `create` when the command names none
    pub default_kind: SessionKind,
    pub tick_rate: u32,
    /// Empty sessions idle this long are destroyed; `None` keeps them
    pub idle_timeout: Option<Duration>,
    pub win_score: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            public_host: "127.0.0.1".to_string(),
            delimiter: Delimiter::Newline,
            max_frame_len: shared::framing::DEFAULT_MAX_FRAME_LEN,
            port_mode: PortMode::Offset,
            base_port: 9000,
            default_kind: SessionKind::Echo,
            tick_rate: DEFAULT_TICK_RATE,
            idle_timeout: None,
            win_score: None,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() || self.public_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if !(1..=1000).contains(&self.tick_rate) {
            return Err(ConfigError::InvalidTickRate(self.tick_rate));
        }
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(ConfigError::FrameLimitTooSmall {
                min: MIN_FRAME_LEN,
                got: self.max_frame_len,
            });
        }
        if self.port_mode == PortMode::Offset && self.base_port == 0 {
            return Err(ConfigError::ZeroBasePort);
        }
        if self.win_score == Some(0) {
            return Err(ConfigError::ZeroWinScore);
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            delimiter: self.delimiter,
            max_frame_len: self.max_frame_len,
            ..ChannelConfig::default()
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate.max(1)))
    }

    pub fn session_address(&self, port: u16) -> String {
        format!("ws://{}:{}", self.public_host, port)
    }
}

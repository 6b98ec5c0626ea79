//! Pieces shared by the broker, the session servers and the clients: the
//! frame codec, the Framed Channel built on it, the JSON wire protocol and the
//! Pong field constants.

pub mod channel;
pub mod framing;
pub mod protocol;

pub use channel::{ChannelConfig, ChannelError, ChannelEvent, FramedChannel};
pub use framing::{Delimiter, FrameCodec, FrameError};
pub use protocol::{BrokerCommand, GameIntent, ProtocolError, SessionKind};

pub const FIELD_WIDTH: f32 = 800.0;
pub const FIELD_HEIGHT: f32 = 600.0;
pub const BALL_SIZE: f32 = 10.0;
/// Ball speed per axis, in field units per second
pub const BALL_SPEED_X: f32 = 240.0;
pub const BALL_SPEED_Y: f32 = 240.0;
pub const PADDLE_WIDTH: f32 = 10.0;
pub const PADDLE_HEIGHT: f32 = 100.0;
/// Fastest a paddle may follow its requested position, units per second
pub const PADDLE_SPEED: f32 = 300.0;
pub const MAX_PLAYERS: usize = 2;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Wire name of the player occupying `slot`.
pub fn player_name(slot: usize) -> String {
    format!("player_{}", slot)
}

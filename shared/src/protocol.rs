//! JSON wire protocol spoken by the broker, the session servers and clients.
//!
//! Every message is a JSON object carried in one frame. Control commands carry
//! a `command` field; game traffic is keyed by payload (`ask_name`, `paddle`).
//! Error replies are always `{"error": <text>}` and never close the connection.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors reported back to the peer that caused them.
///
/// The `Display` text is exactly what goes over the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Missing key: {0}")]
    MissingKey(String),
    #[error("Invalid command")]
    InvalidCommand,
    #[error("Server not found")]
    ServerNotFound,
    #[error("Game is full")]
    GameFull,
    #[error("Failed to create server")]
    CreateFailed,
}

impl ProtocolError {
    pub fn to_reply(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

/// Behaviour of an ephemeral session server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Echo,
    Game,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Echo => write!(f, "echo"),
            SessionKind::Game => write!(f, "game"),
        }
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "echo" => Ok(SessionKind::Echo),
            "game" | "pong" => Ok(SessionKind::Game),
            other => Err(format!("unknown session kind '{}'", other)),
        }
    }
}

/// Termination marker sent by a closing channel.
pub fn close_message() -> Value {
    json!({ "command": "close" })
}

pub fn is_close_message(value: &Value) -> bool {
    value.get("command").and_then(Value::as_str) == Some("close")
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, ProtocolError> {
    value.as_object().ok_or(ProtocolError::InvalidJson)
}

/// Control commands accepted by the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCommand {
    List,
    Create { kind: Option<SessionKind> },
    Join { server_id: u64 },
    Nuke,
    Message { message: Value },
    Close,
}

impl BrokerCommand {
    pub fn parse(value: &Value) -> Result<Self, ProtocolError> {
        let object = as_object(value)?;
        let command = object
            .get("command")
            .ok_or_else(|| ProtocolError::MissingKey("command".to_string()))?
            .as_str()
            .ok_or(ProtocolError::InvalidCommand)?;

        match command {
            "list" => Ok(BrokerCommand::List),
            "create" => {
                let kind = match object.get("kind") {
                    None | Some(Value::Null) => None,
                    Some(kind) => Some(
                        kind.as_str()
                            .and_then(|k| k.parse::<SessionKind>().ok())
                            .ok_or(ProtocolError::InvalidCommand)?,
                    ),
                };
                Ok(BrokerCommand::Create { kind })
            }
            "join" => {
                let server_id = object
                    .get("server_id")
                    .ok_or_else(|| ProtocolError::MissingKey("server_id".to_string()))?;
                // A non-integer id can never name a session
                let server_id = server_id.as_u64().ok_or(ProtocolError::ServerNotFound)?;
                Ok(BrokerCommand::Join { server_id })
            }
            "nuke" => Ok(BrokerCommand::Nuke),
            "message" => {
                let message = object
                    .get("message")
                    .cloned()
                    .ok_or_else(|| ProtocolError::MissingKey("message".to_string()))?;
                Ok(BrokerCommand::Message { message })
            }
            "close" => Ok(BrokerCommand::Close),
            _ => Err(ProtocolError::InvalidCommand),
        }
    }

    pub fn to_message(&self) -> Value {
        match self {
            BrokerCommand::List => json!({ "command": "list" }),
            BrokerCommand::Create { kind: None } => json!({ "command": "create" }),
            BrokerCommand::Create { kind: Some(kind) } => {
                json!({ "command": "create", "kind": kind })
            }
            BrokerCommand::Join { server_id } => {
                json!({ "command": "join", "server_id": server_id })
            }
            BrokerCommand::Nuke => json!({ "command": "nuke" }),
            BrokerCommand::Message { message } => {
                json!({ "command": "message", "message": message })
            }
            BrokerCommand::Close => close_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: u64,
    pub address: String,
    pub clients: usize,
    pub kind: SessionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListReply {
    pub servers: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReply {
    pub message: String,
    pub address: String,
    pub server_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinReply {
    pub message: String,
    pub address: String,
    pub host: String,
    pub port: u16,
    pub server_id: u64,
}

/// Plain acknowledgement, e.g. the reply to `nuke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoReply {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Either a typed success payload or an `{"error": ...}` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Error(ErrorReply),
    Ok(T),
}

/// Messages a client sends to a game session.
#[derive(Debug, Clone, PartialEq)]
pub enum GameIntent {
    AskName,
    Paddle { target: f32 },
    Close,
}

impl GameIntent {
    pub fn parse(value: &Value) -> Result<Self, ProtocolError> {
        let object = as_object(value)?;

        if is_close_message(value) {
            return Ok(GameIntent::Close);
        }
        if object.contains_key("ask_name") {
            return Ok(GameIntent::AskName);
        }
        if let Some(target) = object.get("paddle") {
            let target = target.as_f64().ok_or(ProtocolError::InvalidCommand)?;
            return Ok(GameIntent::Paddle {
                target: target as f32,
            });
        }

        Err(ProtocolError::InvalidCommand)
    }

    pub fn to_message(&self) -> Value {
        match self {
            GameIntent::AskName => json!({ "ask_name": true }),
            GameIntent::Paddle { target } => json!({ "paddle": target }),
            GameIntent::Close => close_message(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub pos: f32,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallView {
    pub pos: [f32; 2],
}

/// Full game state pushed to every member each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    #[serde(flatten)]
    pub players: BTreeMap<String, PlayerView>,
    pub ball: BallView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerNameReply {
    pub player_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStart {
    pub game_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOver {
    pub game_over: bool,
    pub winner: String,
}

/// Classified server-to-client game traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    PlayerName(String),
    Start,
    Snapshot(GameSnapshot),
    Over { winner: String },
    Error(String),
}

impl GameEvent {
    pub fn from_message(value: Value) -> Option<Self> {
        let object = value.as_object()?;

        if let Some(error) = object.get("error").and_then(Value::as_str) {
            return Some(GameEvent::Error(error.to_string()));
        }
        if let Some(name) = object.get("player_name").and_then(Value::as_str) {
            return Some(GameEvent::PlayerName(name.to_string()));
        }
        if object.contains_key("game_start") {
            return Some(GameEvent::Start);
        }
        if object.contains_key("game_over") {
            let over: GameOver = serde_json::from_value(value).ok()?;
            return Some(GameEvent::Over {
                winner: over.winner,
            });
        }
        if object.contains_key("ball") {
            return serde_json::from_value(value).ok().map(GameEvent::Snapshot);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_error_reply_text() {
        assert_eq!(
            ProtocolError::InvalidJson.to_reply(),
            json!({"error": "Invalid JSON format"})
        );
        assert_eq!(
            ProtocolError::MissingKey("server_id".into()).to_reply(),
            json!({"error": "Missing key: server_id"})
        );
        assert_eq!(
            ProtocolError::InvalidCommand.to_reply(),
            json!({"error": "Invalid command"})
        );
        assert_eq!(
            ProtocolError::ServerNotFound.to_reply(),
            json!({"error": "Server not found"})
        );
    }

    #[test]
    fn test_parse_broker_commands() {
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "list"})),
            Ok(BrokerCommand::List)
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "create"})),
            Ok(BrokerCommand::Create { kind: None })
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "create", "kind": "game"})),
            Ok(BrokerCommand::Create {
                kind: Some(SessionKind::Game)
            })
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "join", "server_id": 3})),
            Ok(BrokerCommand::Join { server_id: 3 })
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "nuke"})),
            Ok(BrokerCommand::Nuke)
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "close"})),
            Ok(BrokerCommand::Close)
        );
    }

    #[test]
    fn test_parse_broker_command_errors() {
        assert_eq!(
            BrokerCommand::parse(&json!([1, 2, 3])),
            Err(ProtocolError::InvalidJson)
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"server_id": 1})),
            Err(ProtocolError::MissingKey("command".into()))
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "dance"})),
            Err(ProtocolError::InvalidCommand)
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "join"})),
            Err(ProtocolError::MissingKey("server_id".into()))
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "join", "server_id": "one"})),
            Err(ProtocolError::ServerNotFound)
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "message"})),
            Err(ProtocolError::MissingKey("message".into()))
        );
        assert_eq!(
            BrokerCommand::parse(&json!({"command": "create", "kind": "chess"})),
            Err(ProtocolError::InvalidCommand)
        );
    }

    #[test]
    fn test_commands_survive_to_message_and_back() {
        let commands = vec![
            BrokerCommand::List,
            BrokerCommand::Create {
                kind: Some(SessionKind::Echo),
            },
            BrokerCommand::Join { server_id: 7 },
            BrokerCommand::Nuke,
            BrokerCommand::Message {
                message: json!("hi"),
            },
            BrokerCommand::Close,
        ];

        for command in commands {
            assert_eq!(BrokerCommand::parse(&command.to_message()), Ok(command));
        }
    }

    #[test]
    fn test_reply_distinguishes_errors() {
        let ok: Reply<InfoReply> =
            serde_json::from_value(json!({"message": "All servers nuked"})).unwrap();
        assert_eq!(
            ok,
            Reply::Ok(InfoReply {
                message: "All servers nuked".into()
            })
        );

        let err: Reply<JoinReply> =
            serde_json::from_value(json!({"error": "Server not found"})).unwrap();
        assert_eq!(
            err,
            Reply::Error(ErrorReply {
                error: "Server not found".into()
            })
        );
    }

    #[test]
    fn test_game_intents() {
        assert_eq!(
            GameIntent::parse(&json!({"ask_name": true})),
            Ok(GameIntent::AskName)
        );
        assert_eq!(
            GameIntent::parse(&json!({"command": "close"})),
            Ok(GameIntent::Close)
        );
        assert_eq!(
            GameIntent::parse(&json!({"paddle": "up"})),
            Err(ProtocolError::InvalidCommand)
        );
        assert_eq!(
            GameIntent::parse(&json!({"jump": true})),
            Err(ProtocolError::InvalidCommand)
        );

        match GameIntent::parse(&json!({"paddle": 120.5})) {
            Ok(GameIntent::Paddle { target }) => assert_approx_eq!(target, 120.5),
            other => panic!("unexpected intent {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let mut players = BTreeMap::new();
        players.insert("player_0".to_string(), PlayerView { pos: 300.0, score: 1 });
        players.insert("player_1".to_string(), PlayerView { pos: 250.0, score: 0 });
        let snapshot = GameSnapshot {
            players,
            ball: BallView { pos: [400.0, 300.0] },
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            value,
            json!({
                "player_0": {"pos": 300.0, "score": 1},
                "player_1": {"pos": 250.0, "score": 0},
                "ball": {"pos": [400.0, 300.0]},
            })
        );

        assert_eq!(
            GameEvent::from_message(value),
            Some(GameEvent::Snapshot(snapshot))
        );
    }

    #[test]
    fn test_game_event_classification() {
        assert_eq!(
            GameEvent::from_message(json!({"player_name": "player_1"})),
            Some(GameEvent::PlayerName("player_1".into()))
        );
        assert_eq!(
            GameEvent::from_message(json!({"game_start": true})),
            Some(GameEvent::Start)
        );
        assert_eq!(
            GameEvent::from_message(json!({"game_over": true, "winner": "player_0"})),
            Some(GameEvent::Over {
                winner: "player_0".into()
            })
        );
        assert_eq!(GameEvent::from_message(json!({"echo": "hi"})), None);
    }
}

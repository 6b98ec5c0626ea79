//! Echo sessions: every message is relayed to every member, sender included.

use crate::session::{ClientId, ClientSet, SessionLogic};
use log::debug;
use serde_json::{json, Map, Value};
use shared::{ProtocolError, SessionKind};

/// Builds the broadcast form of `message`: its `message` field becomes
/// `echo`, every other field is kept, and a named sender is added as `from`
/// unless the message already carries one.
pub fn echo_payload(message: Value, sender: Option<&str>) -> Result<Value, ProtocolError> {
    let mut object: Map<String, Value> = match message {
        Value::Object(object) => object,
        _ => return Err(ProtocolError::InvalidJson),
    };

    let text = object
        .remove("message")
        .ok_or_else(|| ProtocolError::MissingKey("message".to_string()))?;
    object.insert("echo".to_string(), text);

    if let Some(name) = sender {
        object
            .entry("from")
            .or_insert_with(|| Value::String(name.to_string()));
    }

    Ok(Value::Object(object))
}

#[derive(Debug, Default)]
pub struct EchoSession;

impl EchoSession {
    pub fn new() -> Self {
        Self
    }

    fn set_name(&self, clients: &mut ClientSet, id: ClientId, message: &Value) {
        let name = match message.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => {
                clients.send_to(id, ProtocolError::InvalidCommand.to_reply());
                return;
            }
            None => {
                clients.send_to(id, ProtocolError::MissingKey("name".to_string()).to_reply());
                return;
            }
        };

        if let Some(client) = clients.get_mut(id) {
            debug!("Client {} is now known as {}", id, name);
            client.display_name = Some(name);
        }
        clients.send_to(id, json!({ "message": "Name set" }));
    }
}

impl SessionLogic for EchoSession {
    fn kind(&self) -> SessionKind {
        SessionKind::Echo
    }

    fn on_message(&mut self, clients: &mut ClientSet, id: ClientId, message: Value) {
        if message.get("command").and_then(Value::as_str) == Some("set_name") {
            self.set_name(clients, id, &message);
            return;
        }

        let sender = clients.get(id).and_then(|client| client.display_name.clone());
        match echo_payload(message, sender.as_deref()) {
            Ok(payload) => {
                clients.broadcast(&payload);
            }
            Err(e) => {
                clients.send_to(id, e.to_reply());
            }
        }
    }
}

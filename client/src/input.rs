//! Turns lines typed on stdin into session traffic

use shared::{GameIntent, FIELD_HEIGHT};

/// What a line typed into an echo session means
#[derive(Debug, Clone, PartialEq)]
pub enum ChatInput {
    SetName(String),
    Message(String),
    Quit,
}

/// `/name <name>` renames, `/quit` leaves, anything else is sent as text.
/// Blank lines produce nothing.
pub fn parse_chat_line(line: &str) -> Option<ChatInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line == "/quit" {
        return Some(ChatInput::Quit);
    }
    if let Some(name) = line.strip_prefix("/name ") {
        let name = name.trim();
        if !name.is_empty() {
            return Some(ChatInput::SetName(name.to_string()));
        }
    }

    Some(ChatInput::Message(line.to_string()))
}

/// A number moves the paddle there; `up`/`down` move it by `step`.
pub fn parse_play_line(line: &str, current: f32, step: f32) -> Option<GameIntent> {
    let line = line.trim();

    let target = match line {
        "" => return None,
        "quit" | "/quit" => return Some(GameIntent::Close),
        "up" | "w" => current - step,
        "down" | "s" => current + step,
        other => other.parse::<f32>().ok()?,
    };

    if !target.is_finite() {
        return None;
    }
    Some(GameIntent::Paddle {
        target: target.clamp(0.0, FIELD_HEIGHT),
    })
}

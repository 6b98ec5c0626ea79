use log::{info, warn};
use shared::protocol::{GameEvent, GameSnapshot};
use shared::FIELD_HEIGHT;

/// Client-side picture of a game session, built from server events.
#[derive(Debug, Clone, Default)]
pub struct GameView {
    pub player_name: Option<String>,
    pub started: bool,
    pub winner: Option<String>,
    pub last_snapshot: Option<GameSnapshot>,
    pub snapshots: u64,
    pub last_error: Option<String>,
}

impl GameView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: GameEvent) {
        match event {
            GameEvent::PlayerName(name) => {
                info!("Playing as {}", name);
                self.player_name = Some(name);
            }
            GameEvent::Start => {
                info!("Game started");
                self.started = true;
            }
            GameEvent::Snapshot(snapshot) => {
                self.snapshots += 1;
                self.last_snapshot = Some(snapshot);
            }
            GameEvent::Over { winner } => {
                info!("Game over, {} wins", winner);
                self.winner = Some(winner);
            }
            GameEvent::Error(error) => {
                warn!("Server error: {}", error);
                self.last_error = Some(error);
            }
        }
    }

    pub fn is_over(&self) -> bool {
        self.winner.is_some()
    }

    /// Last known position of our own paddle, or the field centre.
    pub fn own_paddle(&self) -> f32 {
        self.player_name
            .as_ref()
            .zip(self.last_snapshot.as_ref())
            .and_then(|(name, snapshot)| snapshot.players.get(name))
            .map(|player| player.pos)
            .unwrap_or(FIELD_HEIGHT / 2.0)
    }

    /// One-line scoreboard, e.g. `player_0 2 : player_1 1 | ball (400, 300)`.
    pub fn scoreboard(&self) -> String {
        let snapshot = match &self.last_snapshot {
            Some(snapshot) => snapshot,
            None => return "waiting for game state".to_string(),
        };

        let scores: Vec<String> = snapshot
            .players
            .iter()
            .map(|(name, player)| format!("{} {}", name, player.score))
            .collect();

        format!(
            "{} | ball ({:.0}, {:.0})",
            scores.join(" : "),
            snapshot.ball.pos[0],
            snapshot.ball.pos[1]
        )
    }
}

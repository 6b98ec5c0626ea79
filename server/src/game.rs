//! Pong game sessions.
//!
//! [`GameState`] is the fixed-tick simulation: paddles chase their targets at
//! a capped speed, the ball bounces off the top and bottom walls, and reaching
//! the left or right edge scores and re-serves from the centre. [`PongSession`]
//! wraps it as a [`SessionLogic`], handing out the two player slots and
//! broadcasting a snapshot every tick once both are taken.

use crate::session::{ClientId, ClientSet, SessionLogic};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value;
use shared::protocol::{BallView, GameOver, GameSnapshot, GameStart, PlayerNameReply, PlayerView};
use shared::{
    player_name, GameIntent, ProtocolError, SessionKind, BALL_SIZE, BALL_SPEED_X, BALL_SPEED_Y,
    FIELD_HEIGHT, FIELD_WIDTH, MAX_PLAYERS, PADDLE_HEIGHT, PADDLE_SPEED,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paddle {
    /// Centre of the paddle on the vertical axis
    pub pos: f32,
    /// Where the owning player asked the paddle to go
    pub target: f32,
    pub score: u32,
}

impl Paddle {
    fn new() -> Self {
        Self {
            pos: FIELD_HEIGHT / 2.0,
            target: FIELD_HEIGHT / 2.0,
            score: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ball {
    pub pos: [f32; 2],
    pub vel: [f32; 2],
}

fn random_sign<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    if rng.gen_bool(0.5) {
        1.0
    } else {
        -1.0
    }
}

/// Clamps a requested paddle centre so the paddle stays on the field.
pub fn clamp_paddle(target: f32) -> f32 {
    let half = PADDLE_HEIGHT / 2.0;
    target.clamp(half, FIELD_HEIGHT - half)
}

/// Authoritative Pong state. Only the simulation step writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct GameState {
    pub players: [Paddle; MAX_PLAYERS],
    pub ball: Ball,
}

impl GameState {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut state = Self {
            players: [Paddle::new(); MAX_PLAYERS],
            ball: Ball {
                pos: [0.0, 0.0],
                vel: [0.0, 0.0],
            },
        };
        state.reset_ball(rng);
        state
    }

    /// Puts the ball back in the centre, serving in a random diagonal.
    pub fn reset_ball<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.ball.pos = [FIELD_WIDTH / 2.0, FIELD_HEIGHT / 2.0];
        self.ball.vel = [BALL_SPEED_X * random_sign(rng), BALL_SPEED_Y * random_sign(rng)];
    }

    pub fn set_paddle_target(&mut self, slot: usize, target: f32) {
        if let Some(paddle) = self.players.get_mut(slot) {
            paddle.target = clamp_paddle(target);
        }
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Returns the slot that scored during this step, if any.
    pub fn step<R: Rng + ?Sized>(&mut self, dt: f32, rng: &mut R) -> Option<usize> {
        let max_travel = PADDLE_SPEED * dt;
        for paddle in self.players.iter_mut() {
            let delta = paddle.target - paddle.pos;
            paddle.pos += delta.clamp(-max_travel, max_travel);
        }

        let ball = &mut self.ball;
        ball.pos[0] += ball.vel[0] * dt;
        ball.pos[1] += ball.vel[1] * dt;

        // Bounce only when heading into the wall so a clamped ball cannot stick
        if ball.pos[1] <= 0.0 && ball.vel[1] < 0.0 {
            ball.pos[1] = 0.0;
            ball.vel[1] = -ball.vel[1];
        } else if ball.pos[1] >= FIELD_HEIGHT - BALL_SIZE && ball.vel[1] > 0.0 {
            ball.pos[1] = FIELD_HEIGHT - BALL_SIZE;
            ball.vel[1] = -ball.vel[1];
        }

        let scorer = if ball.pos[0] <= 0.0 {
            Some(1)
        } else if ball.pos[0] >= FIELD_WIDTH - BALL_SIZE {
            Some(0)
        } else {
            None
        };

        if let Some(slot) = scorer {
            self.players[slot].score += 1;
            self.reset_ball(rng);
        }
        scorer
    }

    pub fn snapshot(&self) -> GameSnapshot {
        let players: BTreeMap<String, PlayerView> = self
            .players
            .iter()
            .enumerate()
            .map(|(slot, paddle)| {
                (
                    player_name(slot),
                    PlayerView {
                        pos: paddle.pos,
                        score: paddle.score,
                    },
                )
            })
            .collect();

        GameSnapshot {
            players,
            ball: BallView { pos: self.ball.pos },
        }
    }
}

/// Remote address to slot, assigned once for the life of the session.
#[derive(Debug, Default)]
pub struct SlotAssignments {
    slots: Vec<SocketAddr>,
}

impl SlotAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing slot for `peer`, or assigns the next free one.
    pub fn assign(&mut self, peer: SocketAddr) -> Result<usize, ProtocolError> {
        if let Some(slot) = self.slot_of(peer) {
            return Ok(slot);
        }
        if self.is_full() {
            return Err(ProtocolError::GameFull);
        }
        self.slots.push(peer);
        Ok(self.slots.len() - 1)
    }

    pub fn slot_of(&self, peer: SocketAddr) -> Option<usize> {
        self.slots.iter().position(|assigned| *assigned == peer)
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_PLAYERS
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    WaitingForPlayers,
    Running,
    Finished,
    Nuked,
}

fn broadcast_json<T: Serialize>(clients: &mut ClientSet, message: &T) {
    match serde_json::to_value(message) {
        Ok(value) => {
            clients.broadcast(&value);
        }
        Err(e) => warn!("Failed to serialize game message: {}", e),
    }
}

/// Game session: slot assignment, start signal and the fixed-tick simulation.
pub struct PongSession<R = StdRng> {
    state: GameState,
    slots: SlotAssignments,
    phase: GamePhase,
    win_score: Option<u32>,
    rng: R,
    tick: u64,
}

impl PongSession<StdRng> {
    pub fn new(win_score: Option<u32>) -> Self {
        Self::with_rng(win_score, StdRng::from_entropy())
    }
}

impl<R: Rng> PongSession<R> {
    pub fn with_rng(win_score: Option<u32>, mut rng: R) -> Self {
        Self {
            state: GameState::new(&mut rng),
            slots: SlotAssignments::new(),
            phase: GamePhase::WaitingForPlayers,
            win_score,
            rng,
            tick: 0,
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    fn handle_ask_name(&mut self, clients: &mut ClientSet, id: ClientId, peer: SocketAddr) {
        match self.slots.assign(peer) {
            Ok(slot) => {
                let name = player_name(slot);
                info!("Client {} ({}) plays as {}", id, peer, name);
                if let Ok(reply) = serde_json::to_value(PlayerNameReply { player_name: name }) {
                    clients.send_to(id, reply);
                }

                if self.slots.is_full() && self.phase == GamePhase::WaitingForPlayers {
                    self.start(clients);
                }
            }
            Err(e) => {
                clients.send_to(id, e.to_reply());
            }
        }
    }

    fn start(&mut self, clients: &mut ClientSet) {
        info!("Both players present, starting game");
        self.phase = GamePhase::Running;
        self.state.reset_ball(&mut self.rng);
        broadcast_json(clients, &GameStart { game_start: true });
    }
}

impl<R: Rng + Send + 'static> SessionLogic for PongSession<R> {
    fn kind(&self) -> SessionKind {
        SessionKind::Game
    }

    fn on_message(&mut self, clients: &mut ClientSet, id: ClientId, message: Value) {
        let peer = match clients.peer(id) {
            Some(peer) => peer,
            None => return,
        };

        match GameIntent::parse(&message) {
            Ok(GameIntent::AskName) => self.handle_ask_name(clients, id, peer),
            Ok(GameIntent::Paddle { target }) => match self.slots.slot_of(peer) {
                Some(slot) => self.state.set_paddle_target(slot, target),
                None => debug!("Ignoring paddle intent from spectator {}", peer),
            },
            Ok(GameIntent::Close) => {}
            Err(e) => {
                clients.send_to(id, e.to_reply());
            }
        }
    }

    fn ticks(&self) -> bool {
        self.phase == GamePhase::Running
    }

    fn tick(&mut self, clients: &mut ClientSet, dt: f32) {
        if self.phase != GamePhase::Running {
            return;
        }

        self.tick += 1;
        let scorer = self.state.step(dt, &mut self.rng);
        broadcast_json(clients, &self.state.snapshot());

        if let Some(slot) = scorer {
            let score = self.state.players[slot].score;
            debug!("Tick {}: {} scores ({})", self.tick, player_name(slot), score);

            if self.win_score.map_or(false, |target| score >= target) {
                let winner = player_name(slot);
                info!("Game over, {} wins", winner);
                self.phase = GamePhase::Finished;
                broadcast_json(
                    clients,
                    &GameOver {
                        game_over: true,
                        winner,
                    },
                );
            }
        }
    }

    fn on_shutdown(&mut self, _clients: &mut ClientSet) {
        self.phase = GamePhase::Nuked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use crate::session::outbound_queue;
    use tokio::sync::mpsc::Receiver;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn join(clients: &mut ClientSet, id: ClientId) -> Receiver<Value> {
        let (tx, rx) = outbound_queue();
        clients.insert(id, addr(7000 + id as u16), tx);
        rx
    }

    fn drain(rx: &mut Receiver<Value>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_new_state_is_centred() {
        let state = GameState::new(&mut rng());
        assert_approx_eq!(state.ball.pos[0], FIELD_WIDTH / 2.0);
        assert_approx_eq!(state.ball.pos[1], FIELD_HEIGHT / 2.0);
        assert_approx_eq!(state.ball.vel[0].abs(), BALL_SPEED_X);
        assert_approx_eq!(state.ball.vel[1].abs(), BALL_SPEED_Y);
        assert_eq!(state.players[0].score, 0);
        assert_approx_eq!(state.players[1].pos, FIELD_HEIGHT / 2.0);
    }

    #[test]
    fn test_step_moves_ball_by_velocity() {
        let mut state = GameState::new(&mut rng());
        state.ball.vel = [BALL_SPEED_X, -BALL_SPEED_Y];

        let scorer = state.step(0.1, &mut rng());

        assert_eq!(scorer, None);
        assert_approx_eq!(state.ball.pos[0], FIELD_WIDTH / 2.0 + BALL_SPEED_X * 0.1);
        assert_approx_eq!(state.ball.pos[1], FIELD_HEIGHT / 2.0 - BALL_SPEED_Y * 0.1);
    }

    #[test]
    fn test_step_is_deterministic_for_same_inputs() {
        let mut a = GameState::new(&mut rng());
        let mut b = a.clone();

        for _ in 0..200 {
            a.step(1.0 / 60.0, &mut StdRng::seed_from_u64(1));
            b.step(1.0 / 60.0, &mut StdRng::seed_from_u64(1));
        }

        assert_eq!(a, b);
    }

    #[test]
    fn test_top_wall_bounce_clamps() {
        let mut state = GameState::new(&mut rng());
        state.ball.pos = [400.0, 1.0];
        state.ball.vel = [BALL_SPEED_X, -BALL_SPEED_Y];

        state.step(0.05, &mut rng());

        assert_approx_eq!(state.ball.pos[1], 0.0);
        assert!(state.ball.vel[1] > 0.0);

        // Moving away from the wall does not flip again
        state.step(0.001, &mut rng());
        assert!(state.ball.vel[1] > 0.0);
    }

    #[test]
    fn test_bottom_wall_bounce() {
        let mut state = GameState::new(&mut rng());
        state.ball.pos = [400.0, FIELD_HEIGHT - BALL_SIZE - 1.0];
        state.ball.vel = [BALL_SPEED_X, BALL_SPEED_Y];

        state.step(0.05, &mut rng());

        assert_approx_eq!(state.ball.pos[1], FIELD_HEIGHT - BALL_SIZE);
        assert!(state.ball.vel[1] < 0.0);
    }

    #[test]
    fn test_left_edge_scores_for_player_1() {
        let mut state = GameState::new(&mut rng());
        state.ball.pos = [1.0, 300.0];
        state.ball.vel = [-BALL_SPEED_X, BALL_SPEED_Y];

        let scorer = state.step(0.05, &mut rng());

        assert_eq!(scorer, Some(1));
        assert_eq!(state.players[1].score, 1);
        assert_eq!(state.players[0].score, 0);
        assert_approx_eq!(state.ball.pos[0], FIELD_WIDTH / 2.0);
        assert_approx_eq!(state.ball.pos[1], FIELD_HEIGHT / 2.0);
        assert_approx_eq!(state.ball.vel[0].abs(), BALL_SPEED_X);
    }

    #[test]
    fn test_right_edge_scores_for_player_0() {
        let mut state = GameState::new(&mut rng());
        state.ball.pos = [FIELD_WIDTH - BALL_SIZE - 1.0, 300.0];
        state.ball.vel = [BALL_SPEED_X, BALL_SPEED_Y];

        let scorer = state.step(0.05, &mut rng());

        assert_eq!(scorer, Some(0));
        assert_eq!(state.players[0].score, 1);
        assert_approx_eq!(state.ball.pos[0], FIELD_WIDTH / 2.0);
    }

    #[test]
    fn test_paddle_speed_is_limited() {
        let mut state = GameState::new(&mut rng());
        state.set_paddle_target(0, FIELD_HEIGHT);

        state.step(0.1, &mut rng());

        assert_approx_eq!(state.players[0].target, FIELD_HEIGHT - PADDLE_HEIGHT / 2.0);
        assert_approx_eq!(state.players[0].pos, FIELD_HEIGHT / 2.0 + PADDLE_SPEED * 0.1);

        for _ in 0..100 {
            state.step(0.05, &mut rng());
        }
        assert_approx_eq!(state.players[0].pos, FIELD_HEIGHT - PADDLE_HEIGHT / 2.0);
    }

    #[test]
    fn test_clamp_paddle() {
        assert_approx_eq!(clamp_paddle(-50.0), PADDLE_HEIGHT / 2.0);
        assert_approx_eq!(clamp_paddle(10_000.0), FIELD_HEIGHT - PADDLE_HEIGHT / 2.0);
        assert_approx_eq!(clamp_paddle(300.0), 300.0);
    }

    #[test]
    fn test_snapshot_shape() {
        let state = GameState::new(&mut rng());
        let value = serde_json::to_value(state.snapshot()).unwrap();

        assert!(value["player_0"]["pos"].is_number());
        assert_eq!(value["player_1"]["score"], 0);
        assert_eq!(value["ball"]["pos"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_slot_assignment_is_stable_and_capped() {
        let mut slots = SlotAssignments::new();
        assert_eq!(slots.assign(addr(1)), Ok(0));
        assert_eq!(slots.assign(addr(1)), Ok(0));
        assert_eq!(slots.assign(addr(2)), Ok(1));
        assert!(slots.is_full());
        assert_eq!(slots.assign(addr(3)), Err(ProtocolError::GameFull));
        assert_eq!(slots.assign(addr(2)), Ok(1));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_game_starts_when_second_player_asks() {
        let mut session = PongSession::with_rng(None, rng());
        let mut clients = ClientSet::new();
        let mut rx1 = join(&mut clients, 1);
        let mut rx2 = join(&mut clients, 2);

        session.on_message(&mut clients, 1, json!({"ask_name": true}));
        assert_eq!(session.phase(), GamePhase::WaitingForPlayers);
        assert!(!session.ticks());
        assert_eq!(drain(&mut rx1), vec![json!({"player_name": "player_0"})]);

        session.on_message(&mut clients, 2, json!({"ask_name": true}));
        assert_eq!(session.phase(), GamePhase::Running);
        assert!(session.ticks());

        assert_eq!(
            drain(&mut rx2),
            vec![json!({"player_name": "player_1"}), json!({"game_start": true})]
        );
        assert_eq!(drain(&mut rx1), vec![json!({"game_start": true})]);
    }

    #[test]
    fn test_third_player_gets_game_full() {
        let mut session = PongSession::with_rng(None, rng());
        let mut clients = ClientSet::new();
        let _rx1 = join(&mut clients, 1);
        let _rx2 = join(&mut clients, 2);
        let mut rx3 = join(&mut clients, 3);

        session.on_message(&mut clients, 1, json!({"ask_name": true}));
        session.on_message(&mut clients, 2, json!({"ask_name": true}));
        session.on_message(&mut clients, 3, json!({"ask_name": true}));

        let received = drain(&mut rx3);
        assert_eq!(received.last(), Some(&json!({"error": "Game is full"})));
    }

    #[test]
    fn test_tick_broadcasts_snapshot_only_when_running() {
        let mut session = PongSession::with_rng(None, rng());
        let mut clients = ClientSet::new();
        let mut rx1 = join(&mut clients, 1);
        let _rx2 = join(&mut clients, 2);

        session.tick(&mut clients, 1.0 / 60.0);
        assert!(drain(&mut rx1).is_empty());

        session.on_message(&mut clients, 1, json!({"ask_name": true}));
        session.on_message(&mut clients, 2, json!({"ask_name": true}));
        drain(&mut rx1);

        session.tick(&mut clients, 1.0 / 60.0);
        let messages = drain(&mut rx1);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].get("ball").is_some());
        assert!(messages[0].get("player_0").is_some());
    }

    #[test]
    fn test_paddle_intent_ignored_without_slot() {
        let mut session = PongSession::with_rng(None, rng());
        let mut clients = ClientSet::new();
        let _rx1 = join(&mut clients, 1);
        let _rx2 = join(&mut clients, 2);

        session.on_message(&mut clients, 2, json!({"paddle": 100.0}));
        assert_approx_eq!(session.state().players[0].target, FIELD_HEIGHT / 2.0);
        assert_approx_eq!(session.state().players[1].target, FIELD_HEIGHT / 2.0);

        session.on_message(&mut clients, 1, json!({"ask_name": true}));
        session.on_message(&mut clients, 1, json!({"paddle": 100.0}));
        assert_approx_eq!(session.state().players[0].target, 100.0);
    }

    #[test]
    fn test_invalid_intent_gets_error() {
        let mut session = PongSession::with_rng(None, rng());
        let mut clients = ClientSet::new();
        let mut rx = join(&mut clients, 1);

        session.on_message(&mut clients, 1, json!({"jump": true}));
        assert_eq!(drain(&mut rx), vec![json!({"error": "Invalid command"})]);
    }

    #[test]
    fn test_win_score_finishes_game() {
        let mut session = PongSession::with_rng(Some(1), rng());
        let mut clients = ClientSet::new();
        let mut rx1 = join(&mut clients, 1);
        let _rx2 = join(&mut clients, 2);
        session.on_message(&mut clients, 1, json!({"ask_name": true}));
        session.on_message(&mut clients, 2, json!({"ask_name": true}));
        drain(&mut rx1);

        session.state.ball.pos = [1.0, 300.0];
        session.state.ball.vel = [-BALL_SPEED_X, BALL_SPEED_Y];
        session.tick(&mut clients, 0.05);

        assert_eq!(session.phase(), GamePhase::Finished);
        assert!(!session.ticks());
        let messages = drain(&mut rx1);
        assert_eq!(
            messages.last(),
            Some(&json!({"game_over": true, "winner": "player_1"}))
        );

        // Finished games stop advancing
        session.tick(&mut clients, 0.05);
        assert!(drain(&mut rx1).is_empty());
    }

    #[test]
    fn test_shutdown_marks_nuked() {
        let mut session = PongSession::with_rng(None, rng());
        let mut clients = ClientSet::new();
        session.on_shutdown(&mut clients);
        assert_eq!(session.phase(), GamePhase::Nuked);
    }
}

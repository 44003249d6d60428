//! Protocol state machine for one match.
//!
//! Each client walks the handshake (`dc` -> `dc_ok` -> `is_ready` ->
//! `ready_ok`) independently; once both reach the ready barrier the game
//! log opens with the full replay preamble and turns begin alternating.
//! Every callback runs on the server's event loop, so this type is plain
//! single-threaded state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Config;
use crate::logging::LogSink;
use crate::network::protocol::ClientMessage;
use crate::network::server::SessionSlots;
use crate::rules::{self, ApplyMoveResult, GameState, Move, Player, Simulator, Team};
use crate::trajectory::TrajectoryCompressor;
use crate::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};

/// Errors that abort the match. The server funnel logs them and stops;
/// there is no retry.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("client {client}: {reason}")]
    Protocol { client: usize, reason: String },
    #[error("client {client} deliver message failed")]
    DeliverFailed { client: usize },
    #[error(transparent)]
    Rules(#[from] rules::RulesError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn protocol_error(client: usize, reason: impl Into<String>) -> GameError {
    GameError::Protocol {
        client,
        reason: reason.into(),
    }
}

/// Per-client protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    BeforeSessionStart,
    Dc,
    Ready,
    NewGame,
    MyTurn,
    OpponentTurn,
    GameOver,
}

struct Client {
    state: ClientState,
    name: String,
    players: Vec<Box<dyn Player>>,
    player_order: Vec<usize>,
}

struct LastMove {
    actual_move: Value,
    trajectory: Value,
    free_guard_zone_foul: bool,
}

/// One match: the two client records, the rules state, and the cached
/// JSON envelopes reused across deliveries.
pub struct Game {
    config: Config,
    date_time: String,
    game_id: String,
    json_dc: Value,
    json_is_ready: Value,
    clients: [Client; 2],
    simulator: Box<dyn Simulator>,
    game_state: GameState,
    compressor: TrajectoryCompressor,
    last_move: Option<LastMove>,
    log: Arc<LogSink>,
}

impl Game {
    pub fn new(config: Config, date_time: String, game_id: String, log: Arc<LogSink>) -> Game {
        let json_dc = json!({
            "cmd": "dc",
            "version": {
                "major": PROTOCOL_VERSION_MAJOR,
                "minor": PROTOCOL_VERSION_MINOR,
            },
            "game_id": game_id.clone(),
            "date_time": date_time.clone(),
        });
        let json_is_ready = json!({
            "cmd": "is_ready",
            "game": config.game_is_ready.clone(),
        });

        let clients = [0usize, 1].map(|team| Client {
            state: ClientState::BeforeSessionStart,
            name: String::new(),
            players: config.game.players[team]
                .iter()
                .map(|factory| factory.create_player())
                .collect(),
            player_order: Vec::new(),
        });

        let simulator = config.game.simulator.create_simulator();
        let game_state = GameState::new(&config.game.setting);

        Game {
            config,
            date_time,
            game_id,
            json_dc,
            json_is_ready,
            clients,
            simulator,
            game_state,
            compressor: TrajectoryCompressor::new(),
            last_move: None,
            log,
        }
    }

    pub fn on_session_start(
        &mut self,
        sessions: &SessionSlots,
        client_id: usize,
    ) -> Result<(), GameError> {
        if self.clients[client_id].state != ClientState::BeforeSessionStart {
            return Err(protocol_error(client_id, "session started twice"));
        }
        self.clients[client_id].state = ClientState::Dc;

        self.log.info(&format!("client {client_id}: start connection"));

        sessions.deliver_message(
            client_id,
            self.json_dc.to_string(),
            Some(self.config.server.timeout_dc_ok),
        )
    }

    pub fn on_session_read(
        &mut self,
        sessions: &SessionSlots,
        client_id: usize,
        message: &str,
        elapsed_from_output: Duration,
    ) -> Result<(), GameError> {
        match self.clients[client_id].state {
            ClientState::BeforeSessionStart => Err(protocol_error(
                client_id,
                "received message before contact start",
            )),

            ClientState::Dc => {
                let name = match parse_message(client_id, message)? {
                    ClientMessage::DcOk { name } => name,
                    other => {
                        return Err(unexpected_command(client_id, &other, "dc_ok"));
                    }
                };
                self.clients[client_id].name = name;
                self.clients[client_id].state = ClientState::Ready;

                self.log.info(&format!("client {client_id}: dc_ok"));

                self.json_is_ready["team"] = json!(client_id);
                sessions.deliver_message(client_id, self.json_is_ready.to_string(), None)
            }

            ClientState::Ready => {
                let player_order = match parse_message(client_id, message)? {
                    ClientMessage::ReadyOk { player_order } => player_order,
                    other => {
                        return Err(unexpected_command(client_id, &other, "ready_ok"));
                    }
                };
                validate_player_order(&player_order, self.clients[client_id].players.len())
                    .map_err(|reason| protocol_error(client_id, reason))?;
                self.clients[client_id].player_order = player_order;
                self.clients[client_id].state = ClientState::NewGame;

                self.log.info(&format!("client {client_id}: ready_ok"));

                if self.clients[0].state == ClientState::NewGame
                    && self.clients[1].state == ClientState::NewGame
                {
                    self.start_new_game(sessions)?;
                }
                Ok(())
            }

            ClientState::MyTurn => {
                let mv = match parse_message(client_id, message)? {
                    ClientMessage::Move { mv } => mv,
                    other => {
                        return Err(unexpected_command(client_id, &other, "move"));
                    }
                };
                self.apply_client_move(client_id, mv, elapsed_from_output)?;
                self.deliver_update_message(sessions)
            }

            ClientState::NewGame => Err(protocol_error(
                client_id,
                "received message while waiting for new-game barrier",
            )),

            ClientState::OpponentTurn => Err(protocol_error(
                client_id,
                "received message in opponent turn",
            )),

            ClientState::GameOver => {
                self.log.warning(&format!(
                    "game was over. client {client_id}'s message is ignored."
                ));
                Ok(())
            }
        }
    }

    pub fn on_session_timeout(
        &mut self,
        sessions: &SessionSlots,
        client_id: usize,
    ) -> Result<(), GameError> {
        match self.clients[client_id].state {
            ClientState::MyTurn => {
                self.log
                    .info(&format!("client {client_id}: time limit expired"));

                // The concede is a placeholder; the rules library sees the
                // infinite elapsed time and records the timeout loss.
                self.apply_client_move(client_id, Move::concede(), Duration::MAX)?;
                self.deliver_update_message(sessions)
            }
            _ => Err(protocol_error(
                client_id,
                "timed out at an inappropriate time",
            )),
        }
    }

    pub fn on_session_stop(&mut self, client_id: usize) -> Result<(), GameError> {
        if self.clients[client_id].state != ClientState::GameOver {
            return Err(protocol_error(client_id, "disconnected at inappropriate time"));
        }
        Ok(())
    }

    /// Both peers are past the ready barrier: write the replay preamble to
    /// the game log, announce `new_game`, and hand the first turn out.
    fn start_new_game(&mut self, sessions: &SessionSlots) -> Result<(), GameError> {
        self.log.game(&self.json_dc);

        self.log.game(&json!({
            "cmd": "meta",
            "meta": "spec",
            "host_name": gethostname::gethostname().to_string_lossy(),
        }));

        // The config record carries both the parsed input and a replay
        // config in which the simulator and player factories are replaced
        // by clones of the live instances (materialized seeds included).
        let mut meta_config = json!({
            "cmd": "meta",
            "meta": "config",
        });
        meta_config["config"] = serde_json::to_value(&self.config)?;
        self.config.game.simulator = self.simulator.factory();
        for team in 0..2 {
            self.config.game.players[team] = self.clients[team]
                .players
                .iter()
                .map(|player| player.factory())
                .collect();
        }
        meta_config["config_all"] = serde_json::to_value(&self.config)?;
        self.log.game(&meta_config);

        for (team, client) in self.clients.iter().enumerate() {
            self.log.game(&json!({
                "cmd": "dc_ok",
                "name": client.name.clone(),
                "team": team,
            }));
        }

        self.json_is_ready["team"] = Value::Null;
        self.log.game(&self.json_is_ready);

        for (team, client) in self.clients.iter().enumerate() {
            self.log.game(&json!({
                "cmd": "ready_ok",
                "team": team,
                "player_order": client.player_order.clone(),
            }));
        }

        let new_game = json!({
            "cmd": "new_game",
            "name": {
                "team0": self.clients[0].name.clone(),
                "team1": self.clients[1].name.clone(),
            },
        });
        self.log.game(&new_game);

        self.log.info(&format!(
            "team 0: \"{}\"\nteam 1: \"{}\"\ngame start",
            self.clients[0].name, self.clients[1].name
        ));

        let message = new_game.to_string();
        for client_id in 0..self.clients.len() {
            sessions.deliver_message(client_id, message.clone(), None)?;
        }

        self.deliver_update_message(sessions)
    }

    /// Run one move through the rules library with the compressor attached
    /// to the step stream, then record the shot.
    fn apply_client_move(
        &mut self,
        client_id: usize,
        mut mv: Move,
        elapsed: Duration,
    ) -> Result<(), GameError> {
        debug_assert_eq!(self.game_state.next_team().index(), client_id);

        self.log.game(&json!({
            "cmd": "move",
            "move": serde_json::to_value(&mv)?,
            "team": client_id,
        }));

        // Shot position: 0 lead, 1 second, 2 third, 3 fourth.
        let order_index = usize::from(self.game_state.shot / 4);
        let player_index = self.clients[client_id].player_order[order_index];

        let move_end = self.game_state.end;
        let move_shot = self.game_state.shot;
        let selected_move = serde_json::to_value(&mv)?;

        // The sidecar keeps the trajectory even when it is never sent on
        // the wire, so the compressor always runs.
        self.compressor
            .begin(self.config.server.steps_per_trajectory_frame, move_end);

        let mut apply_result = ApplyMoveResult::default();
        {
            let setting = &self.config.game.setting;
            let client = &mut self.clients[client_id];
            let compressor = &mut self.compressor;
            rules::apply_move(
                setting,
                self.simulator.as_mut(),
                client.players[player_index].as_mut(),
                &mut self.game_state,
                &mut mv,
                elapsed,
                &mut apply_result,
                |sim| compressor.on_step(sim),
            )?;
        }

        self.compressor.end(self.simulator.as_ref());

        let actual_move = serde_json::to_value(&mv)?;
        let trajectory = serde_json::to_value(self.compressor.result())?;

        let shot_record = json!({
            "game_id": self.game_id.clone(),
            "game_date_time": self.date_time.clone(),
            "end": move_end,
            "shot": move_shot,
            "selected_move": selected_move,
            "actual_move": actual_move,
            "trajectory": trajectory,
        });
        self.log.shot(&shot_record, move_end, move_shot);

        self.last_move = Some(LastMove {
            actual_move: shot_record["actual_move"].clone(),
            trajectory: shot_record["trajectory"].clone(),
            free_guard_zone_foul: apply_result.free_guard_zone_foul,
        });

        if self.game_state.shot == 0 {
            self.log_score_summary();
        }

        Ok(())
    }

    fn log_score_summary(&self) {
        for team in 0..2 {
            let mut buf = format!("team {team} score [");
            for score in &self.game_state.scores[team] {
                match score {
                    Some(s) => buf.push_str(&format!(" {s}")),
                    None => buf.push_str(" -"),
                }
            }
            buf.push_str(" | ");
            match self.game_state.extra_end_score[team] {
                Some(s) => buf.push_str(&s.to_string()),
                None => buf.push('-'),
            }
            buf.push_str(&format!(
                " ] total: {}",
                self.game_state.total_score(Team::from_index(team))
            ));
            self.log.info(&buf);
        }
    }

    /// Build the `update` envelope and fan it out. The game log always gets
    /// the trajectory-free version; the wire copy regains the trajectory
    /// when `send_trajectory` is on.
    fn deliver_update_message(&mut self, sessions: &SessionSlots) -> Result<(), GameError> {
        let mut update = json!({
            "cmd": "update",
            "next_team": self.game_state.next_team(),
            "state": serde_json::to_value(&self.game_state)?,
        });
        update["last_move"] = match &self.last_move {
            Some(last) => json!({
                "actual_move": last.actual_move.clone(),
                "free_guard_zone_foul": last.free_guard_zone_foul,
            }),
            None => Value::Null,
        };

        self.log.game(&update);

        if let Some(last) = &self.last_move {
            if self.config.server.send_trajectory {
                update["last_move"]["trajectory"] = last.trajectory.clone();
            }
        }
        let message = update.to_string();

        if let Some(result) = self.game_state.game_result {
            for client in &mut self.clients {
                client.state = ClientState::GameOver;
            }
            sessions.deliver_message(0, message.clone(), None)?;
            sessions.deliver_message(1, message, None)?;

            let game_over = json!({ "cmd": "game_over" });
            self.log.game(&game_over);
            let game_over_message = game_over.to_string();
            sessions.deliver_message(0, game_over_message.clone(), None)?;
            sessions.deliver_message(1, game_over_message, None)?;

            self.log
                .info(&format!("game over\nwin: {}", result.winner.tag()));
        } else {
            let next_team = self.game_state.next_team();
            let opponent = next_team.opponent();

            self.clients[next_team.index()].state = ClientState::MyTurn;
            self.clients[opponent.index()].state = ClientState::OpponentTurn;

            // Only the side to move is on the clock.
            let thinking_time = self.game_state.thinking_time_remaining[next_team.index()];
            sessions.deliver_message(next_team.index(), message.clone(), Some(thinking_time))?;
            sessions.deliver_message(opponent.index(), message, None)?;

            self.log.info(&format!(
                "end: {} ({}/{}), shot: {}, turn: {}",
                self.game_state.end,
                self.game_state.end + 1,
                self.config.game.setting.max_end,
                self.game_state.shot,
                next_team.tag(),
            ));
        }

        Ok(())
    }
}

fn parse_message(client: usize, message: &str) -> Result<ClientMessage, GameError> {
    serde_json::from_str(message)
        .map_err(|e| protocol_error(client, format!("invalid message: {e}")))
}

fn unexpected_command(client: usize, got: &ClientMessage, expected: &str) -> GameError {
    protocol_error(
        client,
        format!("unexpected command \"{}\" (expected \"{expected}\")", got.cmd()),
    )
}

/// `player_order[i]` maps shot position `i` to a player index; it must be
/// a permutation of the roster.
fn validate_player_order(order: &[usize], player_count: usize) -> Result<(), String> {
    if order.len() != player_count {
        return Err("invalid player_order size".to_owned());
    }
    for (i, &a) in order.iter().enumerate() {
        if a >= player_count {
            return Err("player_order index out of range".to_owned());
        }
        if order[i + 1..].contains(&a) {
            return Err("player_order is overlapping".to_owned());
        }
    }
    Ok(())
}

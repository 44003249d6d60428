//! Curling rules library: teams, moves, game state, and move application.
//!
//! The server core treats this module as a fixed collaborator. It owns the
//! rule knowledge (turn order, thinking time, scoring, the five-rock rule)
//! and drives the physics simulator; the protocol layer never inspects
//! stone positions itself.

pub mod player;
pub mod rng;
pub mod simulator;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use player::{Player, PlayerFactory};
pub use simulator::{AllStones, Simulator, SimulatorFactory};

/// Stones each team throws per end.
pub const STONES_PER_TEAM: usize = 8;

/// Total stone slots tracked by the simulator.
pub const TOTAL_STONES: usize = 16;

/// Shots per end (both teams).
pub const SHOTS_PER_END: u8 = 16;

/// Stone radius in meters.
pub const STONE_RADIUS: f32 = 0.145;

/// House (scoring circle) radius in meters.
pub const HOUSE_RADIUS: f32 = 1.829;

/// Center of the house, in sheet coordinates (delivery end at y = 0).
pub const TEE: Vec2 = Vec2 { x: 0.0, y: 38.405 };

/// Far hog line. A delivered stone at rest short of this is out of play.
pub const HOG_LINE_Y: f32 = 32.004;

/// Back line. A stone fully past it is out of play.
pub const BACK_LINE_Y: f32 = 40.234;

/// Half width of the sheet.
pub const SHEET_HALF_WIDTH: f32 = 2.375;

/// Delivery speed cap applied to every shot.
pub const MAX_SHOT_SPEED: f32 = 4.0;

const MAX_SIMULATION_STEPS: usize = 1_000_000;

/// Team tag. Serializes as `0` / `1` on the wire; the string form
/// (`"team0"` / `"team1"`) is used as a JSON map key everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Team {
    Team0,
    Team1,
}

impl Team {
    /// Map key / display form.
    pub fn tag(self) -> &'static str {
        match self {
            Team::Team0 => "team0",
            Team::Team1 => "team1",
        }
    }

    pub fn opponent(self) -> Team {
        match self {
            Team::Team0 => Team::Team1,
            Team::Team1 => Team::Team0,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Panics if `index > 1`; callers index with client ids which are 0 or 1.
    pub fn from_index(index: usize) -> Team {
        match index {
            0 => Team::Team0,
            1 => Team::Team1,
            _ => panic!("team index out of range: {index}"),
        }
    }
}

impl From<Team> for u8 {
    fn from(team: Team) -> u8 {
        team as u8
    }
}

impl TryFrom<u8> for Team {
    type Error = String;

    fn try_from(value: u8) -> Result<Team, String> {
        match value {
            0 => Ok(Team::Team0),
            1 => Ok(Team::Team1),
            _ => Err(format!("invalid team: {value}")),
        }
    }
}

impl std::fmt::Display for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Serialize `[T; 2]` as a JSON object keyed by team tag.
pub mod team_map {
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &[T; 2], serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("team0", &value[0])?;
        map.serialize_entry("team1", &value[1])?;
        map.end()
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<[T; 2], D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Pair<T> {
            team0: T,
            team1: T,
        }
        let pair = Pair::deserialize(deserializer)
            .map_err(|e| D::Error::custom(format!("team-keyed map: {e}")))?;
        Ok([pair.team0, pair.team1])
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub mod ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serialize `[Duration; 2]` as a team-keyed map of milliseconds.
pub mod team_ms {
    use std::time::Duration;

    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Duration; 2], serializer: S) -> Result<S::Ok, S::Error> {
        let millis = [value[0].as_millis() as u64, value[1].as_millis() as u64];
        super::team_map::serialize(&millis, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[Duration; 2], D::Error> {
        let millis: [u64; 2] = super::team_map::deserialize(deserializer)?;
        Ok([
            Duration::from_millis(millis[0]),
            Duration::from_millis(millis[1]),
        ])
    }
}

/// 2D vector in sheet coordinates (meters).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Vec2 {
        Vec2 { x, y }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn distance(self, other: Vec2) -> f32 {
        Vec2::new(self.x - other.x, self.y - other.y).length()
    }
}

/// A single stone's pose. A stone that is out of play has no transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec2,
    pub angle: f32,
}

/// Handle rotation of a delivered stone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Cw,
    Ccw,
}

/// A peer-chosen move: shot parameters or a concede.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Move {
    Shot { velocity: Vec2, rotation: Rotation },
    Concede,
}

impl Move {
    pub fn concede() -> Move {
        Move::Concede
    }
}

/// Immutable match rules: number of ends, five-rock rule, time budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSetting {
    pub max_end: u8,
    #[serde(default = "default_five_rock")]
    pub five_rock_rule: bool,
    #[serde(with = "team_ms")]
    pub thinking_time: [Duration; 2],
}

fn default_five_rock() -> bool {
    true
}

/// Why the game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResultReason {
    Score,
    Concede,
    TimeLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub winner: Team,
    pub reason: GameResultReason,
}

/// Per-team stone lists for the current end.
pub type StoneMap = [Vec<Option<Transform>>; 2];

/// Mutable match state, serialized verbatim into `update` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// Current end, starting at 0. Past `max_end` during extra ends.
    pub end: u8,
    /// Shot within the end, 0..16 counting both teams' throws.
    pub shot: u8,
    /// Team holding the last stone of the current end.
    pub hammer: Team,
    #[serde(with = "team_map")]
    pub stones: StoneMap,
    #[serde(with = "team_map")]
    pub scores: [Vec<Option<u32>>; 2],
    #[serde(with = "team_map")]
    pub extra_end_score: [Option<u32>; 2],
    #[serde(with = "team_ms")]
    pub thinking_time_remaining: [Duration; 2],
    pub game_result: Option<GameResult>,
}

impl GameState {
    pub fn new(setting: &GameSetting) -> GameState {
        GameState {
            end: 0,
            shot: 0,
            // Team 1 has the last stone in the first end.
            hammer: Team::Team1,
            stones: empty_stones(),
            scores: [
                vec![None; setting.max_end as usize],
                vec![None; setting.max_end as usize],
            ],
            extra_end_score: [None, None],
            thinking_time_remaining: setting.thinking_time,
            game_result: None,
        }
    }

    /// Team that throws the next stone. The non-hammer team opens each end.
    pub fn next_team(&self) -> Team {
        if self.shot % 2 == 0 {
            self.hammer.opponent()
        } else {
            self.hammer
        }
    }

    pub fn total_score(&self, team: Team) -> u32 {
        let i = team.index();
        let regulation: u32 = self.scores[i].iter().flatten().sum();
        regulation + self.extra_end_score[i].unwrap_or(0)
    }

    /// Convert the simulator's slot array into per-team stone lists for the
    /// given end. Sides swap every end so that each team always delivers
    /// its own eight stones; this helper hides that convention.
    pub fn stones_from_all_stones(all: &AllStones, end: u8) -> StoneMap {
        let mut map = empty_stones();
        for (slot, stone) in all.iter().enumerate() {
            let side = slot / STONES_PER_TEAM;
            let team = if end % 2 == 0 { side } else { 1 - side };
            map[team][slot % STONES_PER_TEAM] = *stone;
        }
        map
    }
}

fn empty_stones() -> StoneMap {
    [
        vec![None; STONES_PER_TEAM],
        vec![None; STONES_PER_TEAM],
    ]
}

/// Simulator slot for a team's `index`-th stone in the given end.
pub fn stone_slot(team: Team, index: usize, end: u8) -> usize {
    let side = if end % 2 == 0 {
        team.index()
    } else {
        1 - team.index()
    };
    side * STONES_PER_TEAM + index
}

pub fn in_house(position: Vec2) -> bool {
    position.distance(TEE) <= HOUSE_RADIUS + STONE_RADIUS
}

/// Between the hog line and the tee line, outside the house.
pub fn in_free_guard_zone(position: Vec2) -> bool {
    position.y > HOG_LINE_Y && position.y < TEE.y && !in_house(position)
}

fn in_play(position: Vec2) -> bool {
    position.x.abs() + STONE_RADIUS <= SHEET_HALF_WIDTH
        && position.y - STONE_RADIUS <= BACK_LINE_Y
        && position.y >= HOG_LINE_Y
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("move applied to a finished game")]
    GameAlreadyOver,
    #[error("simulation did not settle within {MAX_SIMULATION_STEPS} steps")]
    SimulationDiverged,
}

/// Outcome flags of an applied move.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyMoveResult {
    pub free_guard_zone_foul: bool,
}

/// Apply one move: charge thinking time, let the player error model rewrite
/// the shot, run the physics to rest (reporting every step through
/// `step_callback`), enforce the five-rock rule, and advance shot/end/score
/// bookkeeping. `mv` is rewritten to the move that was actually simulated.
///
/// Thinking-time exhaustion and concedes end the game in-band via
/// `state.game_result`; they are not errors.
#[allow(clippy::too_many_arguments)]
pub fn apply_move(
    setting: &GameSetting,
    simulator: &mut dyn Simulator,
    player: &mut dyn Player,
    state: &mut GameState,
    mv: &mut Move,
    elapsed: Duration,
    result: &mut ApplyMoveResult,
    mut step_callback: impl FnMut(&dyn Simulator),
) -> Result<(), RulesError> {
    if state.game_result.is_some() {
        return Err(RulesError::GameAlreadyOver);
    }

    let team = state.next_team();
    let ti = team.index();
    result.free_guard_zone_foul = false;

    // Time budget first: exhaustion is a loss recorded in the state.
    let remaining = state.thinking_time_remaining[ti];
    if elapsed >= remaining {
        state.thinking_time_remaining[ti] = Duration::ZERO;
        state.game_result = Some(GameResult {
            winner: team.opponent(),
            reason: GameResultReason::TimeLimit,
        });
        return Ok(());
    }
    state.thinking_time_remaining[ti] = remaining - elapsed;

    let (velocity, rotation) = match player.play(mv.clone()) {
        Move::Shot { velocity, rotation } => (clamp_speed(velocity), rotation),
        Move::Concede => {
            state.game_result = Some(GameResult {
                winner: team.opponent(),
                reason: GameResultReason::Concede,
            });
            *mv = Move::Concede;
            return Ok(());
        }
    };
    *mv = Move::Shot { velocity, rotation };

    let before = state.stones.clone();

    // Load the current end into the simulator and deliver the stone.
    let mut all: AllStones = [None; TOTAL_STONES];
    for t in 0..2 {
        for i in 0..STONES_PER_TEAM {
            all[stone_slot(Team::from_index(t), i, state.end)] = state.stones[t][i];
        }
    }
    simulator.load_stones(all);
    let throw_index = usize::from(state.shot / 2);
    simulator.deliver(stone_slot(team, throw_index, state.end), velocity, rotation);

    let mut steps = 0usize;
    while !simulator.all_stones_stopped() {
        simulator.step();
        step_callback(&*simulator);
        steps += 1;
        if steps >= MAX_SIMULATION_STEPS {
            return Err(RulesError::SimulationDiverged);
        }
    }

    // Out-of-play removal happens only once everything has settled, so the
    // step callback sees the terminal positions before removal.
    let settled = simulator.stones();
    for (slot, stone) in settled.iter().enumerate() {
        if matches!(stone, Some(t) if !in_play(t.position)) {
            simulator.remove(slot);
        }
    }

    let after = GameState::stones_from_all_stones(&simulator.stones(), state.end);

    // Five-rock rule: before the sixth stone, knocking an opposing free
    // guard out of play voids the shot and restores the positions.
    let foul = setting.five_rock_rule && state.shot < 5 && {
        let opp = team.opponent().index();
        (0..STONES_PER_TEAM).any(|i| {
            matches!(&before[opp][i], Some(t) if in_free_guard_zone(t.position))
                && after[opp][i].is_none()
        })
    };

    if foul {
        result.free_guard_zone_foul = true;
        state.stones = before;
    } else {
        state.stones = after;
    }

    state.shot += 1;
    if state.shot >= SHOTS_PER_END {
        finish_end(setting, state);
    }

    Ok(())
}

fn clamp_speed(velocity: Vec2) -> Vec2 {
    let speed = velocity.length();
    if speed > MAX_SHOT_SPEED {
        let scale = MAX_SHOT_SPEED / speed;
        Vec2::new(velocity.x * scale, velocity.y * scale)
    } else {
        velocity
    }
}

/// Score the completed end and roll the state over to the next one.
fn finish_end(setting: &GameSetting, state: &mut GameState) {
    let mut distances: [Vec<f32>; 2] = [Vec::new(), Vec::new()];
    for (team, stones) in state.stones.iter().enumerate() {
        for stone in stones.iter().flatten() {
            if in_house(stone.position) {
                distances[team].push(stone.position.distance(TEE));
            }
        }
    }

    let best = |team: usize| -> Option<f32> {
        distances[team].iter().copied().min_by(f32::total_cmp)
    };

    let (scorer, points) = match (best(0), best(1)) {
        (None, None) => (None, 0),
        (Some(_), None) => (Some(Team::Team0), distances[0].len() as u32),
        (None, Some(_)) => (Some(Team::Team1), distances[1].len() as u32),
        (Some(b0), Some(b1)) => {
            if b0 < b1 {
                let count = distances[0].iter().filter(|&&d| d < b1).count() as u32;
                (Some(Team::Team0), count)
            } else if b1 < b0 {
                let count = distances[1].iter().filter(|&&d| d < b0).count() as u32;
                (Some(Team::Team1), count)
            } else {
                (None, 0)
            }
        }
    };

    let end = state.end as usize;
    if state.end < setting.max_end {
        for team in 0..2 {
            let scored = match scorer {
                Some(s) if s.index() == team => points,
                _ => 0,
            };
            state.scores[team][end] = Some(scored);
        }
    } else {
        for team in 0..2 {
            let scored = match scorer {
                Some(s) if s.index() == team => points,
                _ => 0,
            };
            state.extra_end_score[team] = Some(scored);
        }
    }

    // Scoring team gives up the hammer; a blank end keeps it.
    if let Some(scorer) = scorer {
        state.hammer = scorer.opponent();
    }

    state.end += 1;
    state.shot = 0;
    state.stones = empty_stones();

    if state.end >= setting.max_end {
        let t0 = state.total_score(Team::Team0);
        let t1 = state.total_score(Team::Team1);
        if t0 != t1 {
            state.game_result = Some(GameResult {
                winner: if t0 > t1 { Team::Team0 } else { Team::Team1 },
                reason: GameResultReason::Score,
            });
        }
        // Still tied: play another extra end.
    }
}

//! Launch configuration.
//!
//! Parsed once at startup and immutable afterwards. The `game_is_ready`
//! payload echoed to peers during the ready phase is resolved here: either
//! given verbatim, produced by applying a JSON Patch to the `game` subtree,
//! or defaulted to the `game` subtree itself.

use std::time::Duration;

use json_comments::StripComments;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rules::{ms, team_map, GameSetting, PlayerFactory, SimulatorFactory};

/// Players per team under the `normal` rule.
pub const PLAYERS_PER_TEAM: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("specify only one of \"game_is_ready\" or \"game_is_ready_patch\"")]
    GameIsReadyConflict,
    #[error("rule \"normal\" requires {PLAYERS_PER_TEAM} players per team (team{team} has {count})")]
    PlayerCount { team: usize, count: usize },
    #[error("steps_per_trajectory_frame must be at least 1")]
    StepsPerTrajectoryFrame,
    #[error("invalid game_is_ready_patch: {0}")]
    Patch(String),
}

/// Rule tag. Only `normal` (four players a side, eight stones each) exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Normal,
}

/// `server` section: listening ports and wire behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(with = "team_map")]
    pub port: [u16; 2],
    #[serde(with = "ms")]
    pub timeout_dc_ok: Duration,
    /// Parsed and re-serialized for compatibility; nothing acts on it.
    #[serde(with = "ms", default)]
    pub update_interval: Duration,
    pub send_trajectory: bool,
    pub steps_per_trajectory_frame: usize,
}

/// `game` section: rules, simulator, and team rosters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSection {
    pub rule: Rule,
    pub setting: GameSetting,
    pub simulator: SimulatorFactory,
    #[serde(with = "team_map")]
    pub players: [Vec<PlayerFactory>; 2],
}

/// The full launch configuration. Serializes back to the same shape it was
/// parsed from, with the resolved `game_is_ready` payload included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub server: ServerSection,
    pub game: GameSection,
    pub game_is_ready: Value,
}

#[derive(Deserialize)]
struct RawConfig {
    server: ServerSection,
    game: GameSection,
    #[serde(default)]
    game_is_ready: Option<Value>,
    #[serde(default)]
    game_is_ready_patch: Option<Value>,
}

impl Config {
    /// Parse a config document. `//` comments are permitted.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let stripped = StripComments::new(text.as_bytes());
        let raw: RawConfig = serde_json::from_reader(stripped)?;
        Config::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Config, ConfigError> {
        if raw.server.steps_per_trajectory_frame < 1 {
            return Err(ConfigError::StepsPerTrajectoryFrame);
        }

        match raw.game.rule {
            Rule::Normal => {
                for (team, players) in raw.game.players.iter().enumerate() {
                    if players.len() != PLAYERS_PER_TEAM {
                        return Err(ConfigError::PlayerCount {
                            team,
                            count: players.len(),
                        });
                    }
                }
            }
        }

        let game_is_ready = match (raw.game_is_ready, raw.game_is_ready_patch) {
            (Some(_), Some(_)) => return Err(ConfigError::GameIsReadyConflict),
            (Some(value), None) => value,
            (None, Some(patch_value)) => {
                let patch: json_patch::Patch = serde_json::from_value(patch_value)
                    .map_err(|e| ConfigError::Patch(e.to_string()))?;
                let mut doc = serde_json::to_value(&raw.game)?;
                json_patch::patch(&mut doc, &patch)
                    .map_err(|e| ConfigError::Patch(e.to_string()))?;
                doc
            }
            (None, None) => serde_json::to_value(&raw.game)?,
        };

        Ok(Config {
            server: raw.server,
            game: raw.game,
            game_is_ready,
        })
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> Result<Config, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawConfig::deserialize(deserializer)?;
        Config::from_raw(raw).map_err(serde::de::Error::custom)
    }
}

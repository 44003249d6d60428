//! Player error models.
//!
//! A player receives the move its team requested and returns the move that
//! actually gets thrown. The factory travels through the config as a tagged
//! variant; a noise player with no explicit seed materializes one at
//! creation time so the replay config written to the game log reproduces
//! the exact same throws.

use serde::{Deserialize, Serialize};

use super::rng::DeterministicRng;
use super::{Move, Vec2};

/// A single team member. Owns whatever state its error model needs.
pub trait Player: Send {
    /// Rewrite the requested move into the delivered one.
    fn play(&mut self, mv: Move) -> Move;
    /// A factory that recreates this player, seed included.
    fn factory(&self) -> PlayerFactory;
}

/// Player plug-in point, dispatched on the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerFactory {
    /// Throws exactly what was asked.
    Identity,
    /// Gaussian error on shot speed and direction.
    Noise {
        speed_sigma: f32,
        angle_sigma: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
}

impl PlayerFactory {
    pub fn create_player(&self) -> Box<dyn Player> {
        match *self {
            PlayerFactory::Identity => Box::new(IdentityPlayer),
            PlayerFactory::Noise {
                speed_sigma,
                angle_sigma,
                seed,
            } => {
                let seed = seed.unwrap_or_else(entropy_seed);
                Box::new(NoisePlayer {
                    speed_sigma,
                    angle_sigma,
                    seed,
                    rng: DeterministicRng::new(seed),
                })
            }
        }
    }
}

fn entropy_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

struct IdentityPlayer;

impl Player for IdentityPlayer {
    fn play(&mut self, mv: Move) -> Move {
        mv
    }

    fn factory(&self) -> PlayerFactory {
        PlayerFactory::Identity
    }
}

struct NoisePlayer {
    speed_sigma: f32,
    angle_sigma: f32,
    seed: u64,
    rng: DeterministicRng,
}

impl Player for NoisePlayer {
    fn play(&mut self, mv: Move) -> Move {
        match mv {
            Move::Shot { velocity, rotation } => {
                let speed = velocity.length();
                if speed == 0.0 {
                    return Move::Shot { velocity, rotation };
                }
                let new_speed =
                    (speed + self.rng.next_gaussian() as f32 * self.speed_sigma).max(0.0);
                let heading = velocity.y.atan2(velocity.x)
                    + self.rng.next_gaussian() as f32 * self.angle_sigma;
                Move::Shot {
                    velocity: Vec2::new(new_speed * heading.cos(), new_speed * heading.sin()),
                    rotation,
                }
            }
            Move::Concede => Move::Concede,
        }
    }

    fn factory(&self) -> PlayerFactory {
        PlayerFactory::Noise {
            speed_sigma: self.speed_sigma,
            angle_sigma: self.angle_sigma,
            seed: Some(self.seed),
        }
    }
}

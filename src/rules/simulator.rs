//! Deterministic stone physics.
//!
//! A fixed-step integrator with linear ice friction, a small curl drift,
//! and equal-mass circle collisions. Simulator settings travel through the
//! config as a tagged variant so replay configs can reconstruct the exact
//! simulator that produced a log.

use serde::{Deserialize, Serialize};

use super::{Rotation, Transform, Vec2, STONE_RADIUS, TOTAL_STONES};

/// Per-slot stone transforms, `None` when the slot is empty.
pub type AllStones = [Option<Transform>; TOTAL_STONES];

/// Physics backend driven by `apply_move`. One simulator instance lives for
/// the whole match; stones are reloaded before every shot.
pub trait Simulator: Send {
    /// Replace the full stone layout.
    fn load_stones(&mut self, stones: AllStones);
    /// Place a delivered stone at the hack with the given velocity.
    fn deliver(&mut self, slot: usize, velocity: Vec2, rotation: Rotation);
    /// Advance the simulation by one frame.
    fn step(&mut self);
    /// Current transforms of all slots.
    fn stones(&self) -> AllStones;
    fn all_stones_stopped(&self) -> bool;
    fn seconds_per_frame(&self) -> f32;
    /// A factory that recreates this simulator with identical settings.
    fn factory(&self) -> SimulatorFactory;
    /// Take a stone out of play.
    fn remove(&mut self, slot: usize);
}

const DEFAULT_SECONDS_PER_FRAME: f32 = 0.02;
const DEFAULT_FRICTION: f32 = 0.082;

/// Lateral acceleration from handle rotation.
const CURL_ACCEL: f32 = 0.0025;

/// Handle spin given to a delivered stone (rad/s).
const DELIVERY_SPIN: f32 = 1.5;

/// Speeds below this snap to zero.
const STOP_SPEED: f32 = 0.005;

fn default_seconds_per_frame() -> f32 {
    DEFAULT_SECONDS_PER_FRAME
}

fn default_friction() -> f32 {
    DEFAULT_FRICTION
}

/// Simulator plug-in point, dispatched on the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulatorFactory {
    Friction {
        #[serde(default = "default_seconds_per_frame")]
        seconds_per_frame: f32,
        #[serde(default = "default_friction")]
        friction: f32,
    },
}

impl Default for SimulatorFactory {
    fn default() -> Self {
        SimulatorFactory::Friction {
            seconds_per_frame: DEFAULT_SECONDS_PER_FRAME,
            friction: DEFAULT_FRICTION,
        }
    }
}

impl SimulatorFactory {
    pub fn create_simulator(&self) -> Box<dyn Simulator> {
        match *self {
            SimulatorFactory::Friction {
                seconds_per_frame,
                friction,
            } => Box::new(FrictionSimulator::new(seconds_per_frame, friction)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StoneBody {
    position: Vec2,
    angle: f32,
    velocity: Vec2,
    angular_velocity: f32,
}

impl StoneBody {
    fn at_rest(position: Vec2, angle: f32) -> StoneBody {
        StoneBody {
            position,
            angle,
            velocity: Vec2::default(),
            angular_velocity: 0.0,
        }
    }

    fn moving(&self) -> bool {
        self.velocity.x != 0.0 || self.velocity.y != 0.0
    }
}

/// Linear-friction integrator with circle collisions.
pub struct FrictionSimulator {
    seconds_per_frame: f32,
    friction: f32,
    bodies: [Option<StoneBody>; TOTAL_STONES],
}

impl FrictionSimulator {
    fn new(seconds_per_frame: f32, friction: f32) -> FrictionSimulator {
        FrictionSimulator {
            seconds_per_frame,
            friction,
            bodies: [None; TOTAL_STONES],
        }
    }

    fn integrate(&mut self) {
        let dt = self.seconds_per_frame;
        for body in self.bodies.iter_mut().flatten() {
            if !body.moving() {
                continue;
            }
            let speed = body.velocity.length();
            let next_speed = (speed - self.friction * dt).max(0.0);
            if next_speed < STOP_SPEED {
                body.velocity = Vec2::default();
                body.angular_velocity = 0.0;
                continue;
            }
            let dir = Vec2::new(body.velocity.x / speed, body.velocity.y / speed);
            // Curl drifts perpendicular to travel, toward the handle turn.
            // Stones set moving by a collision carry no spin and run straight.
            let curl = if body.angular_velocity == 0.0 {
                0.0
            } else {
                CURL_ACCEL * body.angular_velocity.signum()
            };
            let lateral = Vec2::new(-dir.y * curl * dt, dir.x * curl * dt);
            body.velocity = Vec2::new(
                dir.x * next_speed + lateral.x,
                dir.y * next_speed + lateral.y,
            );
            body.position = Vec2::new(
                body.position.x + body.velocity.x * dt,
                body.position.y + body.velocity.y * dt,
            );
            body.angle += body.angular_velocity * dt;
        }
    }

    fn resolve_collisions(&mut self) {
        for i in 0..TOTAL_STONES {
            for j in (i + 1)..TOTAL_STONES {
                let (Some(a), Some(b)) = (self.bodies[i], self.bodies[j]) else {
                    continue;
                };
                let dx = b.position.x - a.position.x;
                let dy = b.position.y - a.position.y;
                let dist = (dx * dx + dy * dy).sqrt();
                let min_dist = 2.0 * STONE_RADIUS;
                if dist >= min_dist || dist == 0.0 {
                    continue;
                }
                let nx = dx / dist;
                let ny = dy / dist;

                // Separate overlapping stones evenly along the normal.
                let overlap = (min_dist - dist) * 0.5;
                let mut a = a;
                let mut b = b;
                a.position.x -= nx * overlap;
                a.position.y -= ny * overlap;
                b.position.x += nx * overlap;
                b.position.y += ny * overlap;

                // Equal masses: exchange the normal velocity components
                // when the stones are approaching each other.
                let a_n = a.velocity.x * nx + a.velocity.y * ny;
                let b_n = b.velocity.x * nx + b.velocity.y * ny;
                if a_n - b_n > 0.0 {
                    let delta = a_n - b_n;
                    a.velocity.x -= delta * nx;
                    a.velocity.y -= delta * ny;
                    b.velocity.x += delta * nx;
                    b.velocity.y += delta * ny;
                }

                self.bodies[i] = Some(a);
                self.bodies[j] = Some(b);
            }
        }
    }
}

impl Simulator for FrictionSimulator {
    fn load_stones(&mut self, stones: AllStones) {
        for (slot, stone) in stones.iter().enumerate() {
            self.bodies[slot] = stone.map(|t| StoneBody::at_rest(t.position, t.angle));
        }
    }

    fn deliver(&mut self, slot: usize, velocity: Vec2, rotation: Rotation) {
        let spin = match rotation {
            Rotation::Ccw => DELIVERY_SPIN,
            Rotation::Cw => -DELIVERY_SPIN,
        };
        self.bodies[slot] = Some(StoneBody {
            position: Vec2::default(),
            angle: 0.0,
            velocity,
            angular_velocity: spin,
        });
    }

    fn step(&mut self) {
        self.integrate();
        self.resolve_collisions();
    }

    fn stones(&self) -> AllStones {
        let mut out: AllStones = [None; TOTAL_STONES];
        for (slot, body) in self.bodies.iter().enumerate() {
            out[slot] = body.map(|b| Transform {
                position: b.position,
                angle: b.angle,
            });
        }
        out
    }

    fn all_stones_stopped(&self) -> bool {
        self.bodies.iter().flatten().all(|b| !b.moving())
    }

    fn seconds_per_frame(&self) -> f32 {
        self.seconds_per_frame
    }

    fn factory(&self) -> SimulatorFactory {
        SimulatorFactory::Friction {
            seconds_per_frame: self.seconds_per_frame,
            friction: self.friction,
        }
    }

    fn remove(&mut self, slot: usize) {
        self.bodies[slot] = None;
    }
}

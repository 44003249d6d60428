//! Streaming trajectory compression.
//!
//! `apply_move` reports every physics step; keeping all of them would make
//! shot records enormous. The compressor keeps a full snapshot of the first
//! and last frame and, in between, only per-stone differences sampled every
//! `steps_per_frame` steps (plus the terminal frame where everything has
//! settled). Decompression replays the differences onto the start snapshot.

use serde::{Deserialize, Serialize};

use crate::rules::{team_map, GameState, Simulator, StoneMap, Team, STONES_PER_TEAM};

/// One changed stone inside a delta frame. `value` carries the stone's new
/// transform, or null when the stone left play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difference {
    pub team: Team,
    pub index: usize,
    pub value: Option<crate::rules::Transform>,
}

/// Compressed record of one shot: keyframes plus deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub seconds_per_frame: f32,
    #[serde(with = "team_map")]
    pub start: StoneMap,
    #[serde(with = "team_map")]
    pub finish: StoneMap,
    pub frames: Vec<Vec<Difference>>,
}

impl Trajectory {
    fn new() -> Trajectory {
        Trajectory {
            seconds_per_frame: 0.0,
            start: empty_stones(),
            finish: empty_stones(),
            frames: Vec::new(),
        }
    }

    fn reset(&mut self) {
        *self = Trajectory::new();
    }
}

fn empty_stones() -> StoneMap {
    [
        vec![None; STONES_PER_TEAM],
        vec![None; STONES_PER_TEAM],
    ]
}

/// Accumulates one shot's step stream between `begin` and `end`.
pub struct TrajectoryCompressor {
    active: bool,
    frame_count: usize,
    steps_per_frame: usize,
    end: u8,
    prev_stones: StoneMap,
    result: Trajectory,
}

impl TrajectoryCompressor {
    pub fn new() -> TrajectoryCompressor {
        TrajectoryCompressor {
            active: false,
            frame_count: 0,
            steps_per_frame: 0,
            end: 0,
            prev_stones: empty_stones(),
            result: Trajectory::new(),
        }
    }

    /// Start recording a shot. Must not already be recording.
    pub fn begin(&mut self, steps_per_frame: usize, end: u8) {
        assert!(!self.active, "begin() while already recording");
        assert!(steps_per_frame >= 1);

        self.active = true;
        self.frame_count = 0;
        self.steps_per_frame = steps_per_frame;
        self.end = end;
        self.result.reset();
    }

    /// Record one physics step. Must be called between `begin` and `end`.
    pub fn on_step(&mut self, simulator: &dyn Simulator) {
        assert!(self.active, "on_step() outside begin()/end()");

        if self.frame_count == 0 {
            self.set_first_frame(simulator);
        } else if self.frame_count % self.steps_per_frame == 0
            || simulator.all_stones_stopped()
        {
            // A delta every steps_per_frame steps (the first step is the
            // start snapshot, not a delta), plus the settled terminal step.
            self.add_frame_diff(simulator);
        }

        self.frame_count += 1;
    }

    /// Stop recording; the finish snapshot is taken from the simulator as
    /// it stands now. If no step was ever reported, the current snapshot
    /// doubles as the start.
    pub fn end(&mut self, simulator: &dyn Simulator) {
        assert!(self.active, "end() without begin()");

        if self.frame_count == 0 {
            self.set_first_frame(simulator);
        }

        self.result.finish = GameState::stones_from_all_stones(&simulator.stones(), self.end);
        self.active = false;
    }

    /// The compressed shot. Only meaningful after `end`.
    pub fn result(&self) -> &Trajectory {
        assert!(!self.active, "result() while still recording");
        &self.result
    }

    fn set_first_frame(&mut self, simulator: &dyn Simulator) {
        let current = GameState::stones_from_all_stones(&simulator.stones(), self.end);
        self.prev_stones = current.clone();
        self.result.start = current;
        self.result.seconds_per_frame =
            simulator.seconds_per_frame() * self.steps_per_frame as f32;
    }

    fn add_frame_diff(&mut self, simulator: &dyn Simulator) {
        let current = GameState::stones_from_all_stones(&simulator.stones(), self.end);

        let mut diffs = Vec::new();
        for team in 0..2 {
            for index in 0..STONES_PER_TEAM {
                let prev = &self.prev_stones[team][index];
                let cur = &current[team][index];

                // Exact comparison: a stone that has not moved contributes
                // nothing, however small the step.
                let changed = match (prev, cur) {
                    (None, None) => false,
                    (Some(p), Some(c)) => {
                        p.position.x != c.position.x
                            || p.position.y != c.position.y
                            || p.angle != c.angle
                    }
                    _ => true,
                };
                if changed {
                    diffs.push(Difference {
                        team: Team::from_index(team),
                        index,
                        value: *cur,
                    });
                }
            }
        }

        self.result.frames.push(diffs);
        self.prev_stones = current;
    }
}

impl Default for TrajectoryCompressor {
    fn default() -> Self {
        TrajectoryCompressor::new()
    }
}

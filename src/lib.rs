//! # Digital Curling Match Server
//!
//! Authoritative match server for two-player digital curling. Two AI
//! clients connect over TCP, the server mediates the handshake, drives the
//! turn-based game through the physics simulator, enforces thinking-time
//! budgets, and writes a reproducible structured log of the whole match.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    CURLING MATCH SERVER                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  rules/          - Curling rules + physics (deterministic)   │
//! │  ├── mod.rs      - Teams, moves, game state, apply_move      │
//! │  ├── simulator.rs- Friction integrator, tagged factory       │
//! │  ├── player.rs   - Player error models, tagged factory       │
//! │  └── rng.rs      - Xorshift128+ PRNG for replayable noise    │
//! │                                                              │
//! │  network/        - Transport (non-deterministic)             │
//! │  ├── protocol.rs - Client message types (cmd-tagged JSON)    │
//! │  ├── session.rs  - Per-client task: read / write / deadline  │
//! │  └── server.rs   - Acceptor pair + single-owner event loop   │
//! │                                                              │
//! │  game/engine.rs  - Protocol FSM, ready barrier, updates      │
//! │  trajectory.rs   - Keyframe+delta shot compression           │
//! │  logging.rs      - Tagged JSON log sink (run / match / shot) │
//! │  config.rs       - Launch config, game_is_ready resolution   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering guarantees
//!
//! All match state is owned by one event loop; sessions and acceptors only
//! produce events. Per client, deliveries are FIFO and reads are processed
//! in arrival order. The log sink is the only cross-thread component and
//! serializes record ids under its mutex.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod game;
pub mod logging;
pub mod network;
pub mod rules;
pub mod trajectory;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version sent in the `dc` envelope.
pub const PROTOCOL_VERSION_MAJOR: u32 = 2;
/// Wire protocol minor version.
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

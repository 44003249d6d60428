//! Match engine.
//!
//! The protocol state machine lives in `engine`; everything rule-shaped
//! (turn order, scoring, physics) is delegated to `crate::rules`.

pub mod engine;

pub use engine::{Game, GameError};

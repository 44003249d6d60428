//! Wire message types.
//!
//! Framing is newline-delimited UTF-8 JSON, one object per line. Client
//! messages are dispatched on the `cmd` tag; server envelopes are built as
//! `serde_json::Value` because `dc` and `is_ready` embed config-supplied
//! opaque payloads.

use serde::{Deserialize, Serialize};

/// Messages a peer may send, selected by `cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake reply carrying the team's display name.
    DcOk { name: String },

    /// Ready reply mapping shot positions to player indices.
    ReadyOk { player_order: Vec<usize> },

    /// The active team's shot (or concede).
    Move {
        #[serde(rename = "move")]
        mv: crate::rules::Move,
    },
}

impl ClientMessage {
    /// The `cmd` tag this message was sent with.
    pub fn cmd(&self) -> &'static str {
        match self {
            ClientMessage::DcOk { .. } => "dc_ok",
            ClientMessage::ReadyOk { .. } => "ready_ok",
            ClientMessage::Move { .. } => "move",
        }
    }
}

//! Network layer: wire protocol, per-client sessions, acceptor pair.
//!
//! Everything here is transport plumbing; match semantics live in
//! `crate::game`. Sessions and acceptors report into one event channel so
//! the game loop is the sole owner of match state.

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::ClientMessage;
pub use server::{start, ServerError, SessionSlots};
pub use session::{Session, SessionEvent};

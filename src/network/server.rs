//! Acceptor pair and the match event loop.
//!
//! One listener per team, each accepting exactly one peer. Acceptors and
//! session tasks all feed a single event channel; the loop below is the
//! only place game state is touched, so the whole match is serialized
//! without locks. Any error out of a game callback hits the funnel:
//! log at `err`, broadcast shutdown, done.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::config::Config;
use crate::game::{Game, GameError};
use crate::logging::LogSink;
use crate::network::session::{Session, SessionEvent};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind team {team} port {port}: {source}")]
    Bind {
        team: usize,
        port: u16,
        source: std::io::Error,
    },
}

/// The two session slots, indexed by client id (= team id). Handed into
/// game callbacks so the engine can send without owning the sessions.
#[derive(Default)]
pub struct SessionSlots {
    slots: [Option<Session>; 2],
}

impl SessionSlots {
    /// Queue a message for a client, optionally arming its input deadline.
    /// Fails if the slot is empty or the session has closed.
    pub fn deliver_message(
        &self,
        client_id: usize,
        message: String,
        input_timeout: Option<Duration>,
    ) -> Result<(), GameError> {
        match &self.slots[client_id] {
            Some(session) if session.deliver(message, input_timeout) => Ok(()),
            _ => Err(GameError::DeliverFailed { client: client_id }),
        }
    }

    fn place(&mut self, client_id: usize, session: Session) {
        self.slots[client_id] = Some(session);
    }

    fn remove(&mut self, client_id: usize) {
        self.slots[client_id] = None;
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn clear(&mut self) {
        self.slots = [None, None];
    }
}

/// Bind both listeners and run the match to completion.
///
/// Runtime failures (protocol violations, write errors) are fail-stop:
/// logged through the sink, sessions torn down, and the function returns
/// `Ok` — the process exits 0 either way. Only startup failures surface
/// as `Err`.
pub async fn start(
    config: Config,
    log: Arc<LogSink>,
    date_time: String,
    game_id: String,
) -> Result<(), ServerError> {
    log.info(&format!("launch time: {date_time}"));
    log.info(&format!("game id    : {game_id}"));
    for (team, port) in config.server.port.iter().enumerate() {
        log.info(&format!("team {team} port: {port}"));
    }
    log.info("Note: Team 1 has the last stone in the first end.");

    let mut listeners = Vec::with_capacity(2);
    for (team, &port) in config.server.port.iter().enumerate() {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ServerError::Bind { team, port, source })?;
        listeners.push(listener);
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(4);

    // Single-shot acceptors: each listener hands over at most one peer and
    // is never re-armed, so later connections on the same port go nowhere.
    for (client_id, listener) in listeners.into_iter().enumerate() {
        let events = event_tx.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!(client_id, %addr, "accepted connection");
                        let _ = events.send(SessionEvent::Accepted { client_id, stream });
                    }
                    Err(e) => debug!(client_id, "accept failed: {e}"),
                },
                _ = shutdown.recv() => {}
            }
        });
    }

    let mut game = Game::new(config, date_time, game_id, Arc::clone(&log));
    let mut sessions = SessionSlots::default();
    let mut accepted = [false, false];

    log.info("server started");

    while let Some(event) = event_rx.recv().await {
        let result = match event {
            SessionEvent::Accepted { client_id, stream } => {
                if accepted[client_id] {
                    // The acceptor fires once, so this cannot happen; the
                    // check keeps a stray event from clobbering a session.
                    Ok(())
                } else {
                    accepted[client_id] = true;
                    sessions.place(
                        client_id,
                        Session::open(
                            stream,
                            client_id,
                            event_tx.clone(),
                            shutdown_tx.subscribe(),
                            Arc::clone(&log),
                        ),
                    );
                    Ok(())
                }
            }
            SessionEvent::Started { client_id } => game.on_session_start(&sessions, client_id),
            SessionEvent::Read {
                client_id,
                message,
                elapsed_from_output,
            } => game.on_session_read(&sessions, client_id, &message, elapsed_from_output),
            SessionEvent::InputTimeout { client_id } => {
                game.on_session_timeout(&sessions, client_id)
            }
            SessionEvent::Stopped { client_id } => {
                sessions.remove(client_id);
                game.on_session_stop(client_id)
            }
            SessionEvent::WriteError { client_id } => {
                // The session already logged the error; just tear down.
                debug!(client_id, "write error, stopping server");
                stop(&shutdown_tx, &mut sessions, &log);
                break;
            }
        };

        if let Err(e) = result {
            log.error(&e.to_string());
            stop(&shutdown_tx, &mut sessions, &log);
            break;
        }

        // Normal completion: both peers connected at some point and both
        // sessions are gone again (game over, peers hung up).
        if accepted == [true, true] && sessions.is_empty() {
            break;
        }
    }

    let _ = shutdown_tx.send(());
    Ok(())
}

fn stop(shutdown: &broadcast::Sender<()>, sessions: &mut SessionSlots, log: &LogSink) {
    let _ = shutdown.send(());
    sessions.clear();
    log.debug("server stopped");
}

//! Per-client TCP session.
//!
//! One task per connected peer. The task owns the socket and runs a single
//! `select!` loop over three concerns: reading newline-framed messages,
//! draining the outbound queue, and watching the input deadline. Keeping
//! all three on one task means `last_output_time` and the deadline are
//! plain locals; everything the rest of the server needs arrives as a
//! [`SessionEvent`] on the shared channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

use crate::logging::{LogSink, Target};

/// Everything a session (or acceptor) reports to the game loop.
pub enum SessionEvent {
    /// A listener accepted its one connection.
    Accepted { client_id: usize, stream: TcpStream },
    /// The session task is up; the handshake may begin.
    Started { client_id: usize },
    /// One complete line from the peer, without the terminator.
    Read {
        client_id: usize,
        message: String,
        elapsed_from_output: Duration,
    },
    /// The input deadline fired.
    InputTimeout { client_id: usize },
    /// The peer went away (orderly close or read error).
    Stopped { client_id: usize },
    /// A write failed. Always fatal for the match.
    WriteError { client_id: usize },
}

struct Outbound {
    message: String,
    input_timeout: Option<Duration>,
}

/// Handle held by the server. The task behind it closes itself on read
/// errors or on the shutdown broadcast.
pub struct Session {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl Session {
    /// Bind a session to a connected socket and start its task.
    pub fn open(
        stream: TcpStream,
        client_id: usize,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: broadcast::Receiver<()>,
        log: Arc<LogSink>,
    ) -> Session {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_session(
            stream,
            client_id,
            events,
            outbound_rx,
            shutdown,
            Arc::clone(&closed),
            log,
        ));

        Session {
            outbound: outbound_tx,
            closed,
        }
    }

    /// Queue a message for the peer. Never blocks. Returns false if the
    /// session is already closed.
    pub fn deliver(&self, message: String, input_timeout: Option<Duration>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound
            .send(Outbound {
                message,
                input_timeout,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn run_session(
    stream: TcpStream,
    client_id: usize,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: broadcast::Receiver<()>,
    closed: Arc<AtomicBool>,
    log: Arc<LogSink>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::new();

    // +infinity sentinels: None means "never".
    let mut last_output: Option<Instant> = None;
    let mut deadline: Option<Instant> = None;

    debug!(client_id, "session task started");
    let _ = events.send(SessionEvent::Started { client_id });

    loop {
        let deadline_wait = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = reader.read_until(b'\n', &mut line) => {
                match result {
                    Ok(n) if n > 0 && line.ends_with(b"\n") => {
                        let elapsed_from_output = last_output
                            .map(|t| Instant::now().saturating_duration_since(t))
                            .unwrap_or(Duration::ZERO);

                        // A complete message arrived in time.
                        deadline = None;

                        line.pop();
                        if line.ends_with(b"\r") {
                            line.pop();
                        }
                        let message = String::from_utf8_lossy(&line).into_owned();

                        log.trace(Target::Client(client_id), Target::Server, &message);
                        log.debug(&format!(
                            "client {client_id}: elapsed_from_output={}ms, msg_length={}",
                            elapsed_from_output.as_millis(),
                            message.len()
                        ));

                        let _ = events.send(SessionEvent::Read {
                            client_id,
                            message,
                            elapsed_from_output,
                        });
                        line.clear();
                    }
                    Ok(_) => {
                        // EOF, possibly mid-line. An orderly close from the
                        // peer lands here too, so this is not an error yet.
                        log.debug(&format!(
                            "client {client_id}'s session will be stopped (read: eof)"
                        ));
                        let _ = events.send(SessionEvent::Stopped { client_id });
                        break;
                    }
                    Err(e) => {
                        log.debug(&format!(
                            "client {client_id}'s session will be stopped (read: {e})"
                        ));
                        let _ = events.send(SessionEvent::Stopped { client_id });
                        break;
                    }
                }
            }

            outbound = outbound_rx.recv() => {
                let Some(Outbound { message, input_timeout }) = outbound else {
                    break;
                };
                let mut bytes = message.into_bytes();
                bytes.push(b'\n');
                match write_half.write_all(&bytes).await {
                    Ok(()) => {
                        let now = Instant::now();
                        last_output = Some(now);
                        deadline = input_timeout.and_then(|t| now.checked_add(t));

                        bytes.pop();
                        let text = String::from_utf8_lossy(&bytes);
                        log.trace(Target::Server, Target::Client(client_id), &text);
                    }
                    Err(e) => {
                        log.error(&format!("client {client_id} error (write): {e}"));
                        let _ = events.send(SessionEvent::WriteError { client_id });
                        break;
                    }
                }
            }

            _ = deadline_wait => {
                // One shot per arming; the game decides what it means.
                deadline = None;
                let _ = events.send(SessionEvent::InputTimeout { client_id });
            }

            _ = shutdown.recv() => {
                debug!(client_id, "session task shutting down");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    log.debug(&format!("client {client_id}'s session was stopped"));
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn session_fixture() -> (
        Session,
        TcpStream,
        mpsc::UnboundedReceiver<SessionEvent>,
        broadcast::Sender<()>,
    ) {
        let dir =
            std::env::temp_dir().join(format!("curling-server-sesstest-{}", uuid::Uuid::new_v4()));
        let log = Arc::new(LogSink::new(&dir, "match", false, false).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let session = Session::open(
            server_side,
            0,
            event_tx,
            shutdown_tx.subscribe(),
            log,
        );
        (session, client, event_rx, shutdown_tx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn started_event_fires_on_open() {
        let (_session, _client, mut events, _shutdown) = session_fixture().await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Started { client_id: 0 }
        ));
    }

    #[tokio::test]
    async fn delivers_with_newline_framing() {
        let (session, mut client, mut events, _shutdown) = session_fixture().await;
        let _ = next_event(&mut events).await; // Started

        assert!(session.deliver(r#"{"cmd":"dc"}"#.to_owned(), None));

        let mut buf = vec![0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"cmd\":\"dc\"}\n");
    }

    #[tokio::test]
    async fn first_read_has_zero_elapsed() {
        use tokio::io::AsyncWriteExt;
        let (_session, mut client, mut events, _shutdown) = session_fixture().await;
        let _ = next_event(&mut events).await; // Started

        client.write_all(b"{\"cmd\":\"dc_ok\"}\n").await.unwrap();

        match next_event(&mut events).await {
            SessionEvent::Read {
                client_id,
                message,
                elapsed_from_output,
            } => {
                assert_eq!(client_id, 0);
                assert_eq!(message, "{\"cmd\":\"dc_ok\"}");
                assert_eq!(elapsed_from_output, Duration::ZERO);
            }
            _ => panic!("expected Read event"),
        }
    }

    #[tokio::test]
    async fn silence_past_the_deadline_times_out() {
        let (session, _client, mut events, _shutdown) = session_fixture().await;
        let _ = next_event(&mut events).await; // Started

        session.deliver("{}".to_owned(), Some(Duration::from_millis(50)));

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::InputTimeout { client_id: 0 }
        ));
    }

    #[tokio::test]
    async fn reply_in_time_cancels_the_deadline() {
        use tokio::io::AsyncWriteExt;
        let (session, mut client, mut events, _shutdown) = session_fixture().await;
        let _ = next_event(&mut events).await; // Started

        session.deliver("{}".to_owned(), Some(Duration::from_millis(200)));
        client.write_all(b"{\"cmd\":\"dc_ok\"}\n").await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Read { .. }
        ));

        // No timeout after the reply.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_close_stops_the_session() {
        let (session, client, mut events, _shutdown) = session_fixture().await;
        let _ = next_event(&mut events).await; // Started

        drop(client);

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Stopped { client_id: 0 }
        ));

        // The handle observes the closed flag shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_closed());
        assert!(!session.deliver("{}".to_owned(), None));
    }

    #[tokio::test]
    async fn shutdown_broadcast_closes_the_session() {
        let (session, _client, mut events, shutdown) = session_fixture().await;
        let _ = next_event(&mut events).await; // Started

        let _ = shutdown.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn messages_preserve_fifo_order() {
        let (session, client, mut events, _shutdown) = session_fixture().await;
        let _ = next_event(&mut events).await; // Started

        for i in 0..10 {
            session.deliver(format!("{{\"seq\":{i}}}"), None);
        }

        let mut reader = tokio::io::BufReader::new(client);
        let mut line = String::new();
        for i in 0..10 {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), format!("{{\"seq\":{i}}}"));
        }
    }
}

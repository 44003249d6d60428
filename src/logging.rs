//! Structured log sink.
//!
//! Every observable event of a match flows through here as a tagged JSON
//! envelope. Records are routed to up to three places: the run-wide
//! `server.log`, the per-match `game.dcl2`, and per-shot sidecar files.
//! The sink is the only component shared across threads, so all record
//! construction happens under its mutex — that is also what makes the
//! record `id` strictly increasing process-wide.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Value};
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// Envelope version written into every record.
pub const LOG_VERSION: [u32; 2] = [1, 0];

const ALL_LOG_FILE: &str = "server.log";
const GAME_LOG_FILE: &str = "game.dcl2";

const TAG_TRACE: &str = "trc";
const TAG_DEBUG: &str = "dbg";
const TAG_INFO: &str = "inf";
const TAG_GAME: &str = "gam";
const TAG_SHOT: &str = "sht";
const TAG_WARNING: &str = "wrn";
const TAG_ERROR: &str = "err";

const EXTENDED: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
);
const BASIC: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]");
const TIME_OF_DAY: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

/// Local time, falling back to UTC when the offset cannot be determined
/// (multi-threaded environments on some platforms).
pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `YYYY-MM-DDThh:mm:ss±hh:mm`
pub fn iso8601_extended(t: OffsetDateTime) -> String {
    t.format(&EXTENDED).expect("iso8601 extended format")
}

/// `YYYYMMDDThhmmss`, used in the match directory name.
pub fn iso8601_basic(t: OffsetDateTime) -> String {
    t.format(&BASIC).expect("iso8601 basic format")
}

fn time_of_day(t: OffsetDateTime) -> String {
    t.format(&TIME_OF_DAY).expect("time of day format")
}

/// Endpoint named in a `trc` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Server,
    Client(usize),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Server => f.write_str("server"),
            Target::Client(id) => write!(f, "client{id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log directory already exists: {0}")]
    MatchDirectoryExists(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    directory_created: bool,
    file_all: File,
    file_game: Option<File>,
}

/// The sink. One per process, handed around as `Arc<LogSink>`.
#[derive(Debug)]
pub struct LogSink {
    match_directory: PathBuf,
    verbose: bool,
    debug: bool,
    inner: Mutex<Inner>,
}

impl LogSink {
    /// Open the run-wide log under `log_dir` and reserve the match
    /// directory name. Fails if the match directory already exists; the
    /// directory itself is only created once something gets written to it.
    pub fn new(
        log_dir: &Path,
        match_dir_name: &str,
        verbose: bool,
        debug: bool,
    ) -> Result<LogSink, LogError> {
        std::fs::create_dir_all(log_dir)?;

        let match_directory = log_dir.join(match_dir_name);
        if match_directory.exists() {
            return Err(LogError::MatchDirectoryExists(match_directory));
        }

        let file_all = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(ALL_LOG_FILE))?;

        Ok(LogSink {
            match_directory,
            verbose,
            debug,
            inner: Mutex::new(Inner {
                next_id: 0,
                directory_created: false,
                file_all,
                file_game: None,
            }),
        })
    }

    /// Peer <-> server traffic. Run-wide file only.
    pub fn trace(&self, from: Target, to: Target, message: &str) {
        let mut inner = self.lock();
        let record = inner.make_record(
            TAG_TRACE,
            json!({
                "from": from.to_string(),
                "to": to.to_string(),
                "msg": message,
            }),
        );
        inner.append_all(&record);
    }

    pub fn debug(&self, message: &str) {
        let mut inner = self.lock();
        let t = now_local();
        let record = inner.make_record(TAG_DEBUG, Value::String(message.to_owned()));
        if self.debug {
            if self.verbose {
                println!("{record}");
            } else {
                console_put(false, t, "[debug] ", message);
            }
        }
        inner.append_all(&record);
    }

    pub fn info(&self, message: &str) {
        let mut inner = self.lock();
        let t = now_local();
        let record = inner.make_record(TAG_INFO, Value::String(message.to_owned()));
        if self.verbose {
            println!("{record}");
        } else {
            console_put(false, t, "", message);
        }
        inner.append_all(&record);
    }

    /// Match-log event. Creates the match directory and `game.dcl2` on
    /// first use.
    pub fn game(&self, payload: &Value) {
        let mut inner = self.lock();
        let record = inner.make_record(TAG_GAME, payload.clone());
        if let Err(e) = inner.ensure_game_file(&self.match_directory) {
            eprintln!("failed to open game log: {e}");
            return;
        }
        if self.verbose {
            println!("{record}");
        }
        if let Some(file) = inner.file_game.as_mut() {
            let _ = writeln!(file, "{record}");
        }
        inner.append_all(&record);
    }

    /// Per-shot sidecar, pretty-printed as a standalone file.
    pub fn shot(&self, payload: &Value, end: u8, shot: u8) {
        let mut inner = self.lock();
        let record = inner.make_record(TAG_SHOT, payload.clone());
        if let Err(e) = inner.ensure_directory(&self.match_directory) {
            eprintln!("failed to create match directory: {e}");
            return;
        }
        let path = self
            .match_directory
            .join(format!("shot_e{end:03}s{shot:02}.json"));
        match File::create(&path) {
            Ok(mut file) => {
                let pretty = serde_json::to_string_pretty(&record).unwrap_or_default();
                let _ = writeln!(file, "{pretty}");
            }
            Err(e) => eprintln!("failed to write {}: {e}", path.display()),
        }
        inner.append_all(&record);
    }

    pub fn warning(&self, message: &str) {
        let mut inner = self.lock();
        let t = now_local();
        let record = inner.make_record(TAG_WARNING, Value::String(message.to_owned()));
        console_put(true, t, "[warning] ", message);
        inner.append_all(&record);
    }

    /// Fatal diagnostics. Mirrored to the game log when one is open so a
    /// truncated match log records why it is truncated.
    pub fn error(&self, message: &str) {
        let mut inner = self.lock();
        let t = now_local();
        let record = inner.make_record(TAG_ERROR, Value::String(message.to_owned()));
        console_put(true, t, "[error] ", message);
        inner.append_all(&record);
        if let Some(file) = inner.file_game.as_mut() {
            let _ = writeln!(file, "{record}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn make_record(&mut self, tag: &str, payload: Value) -> Value {
        let record = json!({
            "ver": [LOG_VERSION[0], LOG_VERSION[1]],
            "tag": tag,
            "id": self.next_id,
            "date_time": iso8601_extended(now_local()),
            "thread": format!("{:?}", std::thread::current().id()),
            "log": payload,
        });
        self.next_id += 1;
        record
    }

    fn append_all(&mut self, record: &Value) {
        let _ = writeln!(self.file_all, "{record}");
    }

    fn ensure_directory(&mut self, match_directory: &Path) -> std::io::Result<()> {
        if !self.directory_created {
            std::fs::create_dir_all(match_directory)?;
            self.directory_created = true;
        }
        Ok(())
    }

    fn ensure_game_file(&mut self, match_directory: &Path) -> std::io::Result<()> {
        self.ensure_directory(match_directory)?;
        if self.file_game.is_none() {
            self.file_game = Some(File::create(match_directory.join(GAME_LOG_FILE))?);
        }
        Ok(())
    }
}

/// Print `message` with a `[hh:mm:ss] header` prefix on every line.
fn console_put(use_stderr: bool, t: OffsetDateTime, header: &str, message: &str) {
    let prefix = format!("[{}] {header}", time_of_day(t));
    for line in message.split('\n') {
        if use_stderr {
            eprintln!("{prefix}{line}");
        } else {
            println!("{prefix}{line}");
        }
    }
}

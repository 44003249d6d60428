//! Digital curling match server CLI.
//!
//! Fixes the launch time and match id, brings up the log sink, parses the
//! config, and runs the server. Errors after the sink is up are logged and
//! swallowed; the process exits 0 either way.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use time::OffsetDateTime;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use curling_server::config::Config;
use curling_server::logging::{self, LogSink};
use curling_server::{network, VERSION};

#[derive(Parser, Debug)]
#[command(
    name = "curling-server",
    version,
    about = "Match server for two-player digital curling"
)]
struct Args {
    /// Print raw log records on stdout.
    #[arg(short, long)]
    verbose: bool,

    /// Mirror debug records to the console.
    #[arg(long)]
    debug: bool,

    /// Config file path.
    #[arg(short = 'C', long, default_value = "config.json", conflicts_with = "config_json")]
    config: PathBuf,

    /// Inline config JSON instead of a file.
    #[arg(long)]
    config_json: Option<String>,

    /// Directory for the run-wide log and per-match directories.
    #[arg(long, default_value = "log")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::WARN })
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let launch_time = logging::now_local();
    let game_id = uuid::Uuid::new_v4().to_string();
    let match_dir_name = format!("{}_{}", logging::iso8601_basic(launch_time), game_id);

    let log = match LogSink::new(&args.log_dir, &match_dir_name, args.verbose, args.debug) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            // The sink never came up; stderr is all there is.
            eprintln!("exception: {e}");
            return;
        }
    };

    if let Err(e) = run(args, launch_time, game_id, Arc::clone(&log)).await {
        log.error(&format!("exception: {e:#}"));
    }
}

async fn run(
    args: Args,
    launch_time: OffsetDateTime,
    game_id: String,
    log: Arc<LogSink>,
) -> anyhow::Result<()> {
    log.info(&format!("Digital curling server ver.{VERSION}"));
    log.debug(if args.debug { "debug: on" } else { "debug: off" });
    log.debug(if args.verbose {
        "verbose: on"
    } else {
        "verbose: off"
    });
    log.info(&format!("log directory : \"{}\"", args.log_dir.display()));

    let config_text = match &args.config_json {
        Some(text) => {
            log.debug("config: (inline json)");
            text.clone()
        }
        None => {
            log.info(&format!("config file   : \"{}\"", args.config.display()));
            std::fs::read_to_string(&args.config).with_context(|| {
                format!("could not open config file \"{}\"", args.config.display())
            })?
        }
    };
    let config = Config::parse(&config_text)?;

    network::start(
        config,
        log.clone(),
        logging::iso8601_extended(launch_time),
        game_id,
    )
    .await?;

    log.info("server terminated successfully");
    Ok(())
}

//! timeledger CLI
//!
//! `start` and `run` own the timer for as long as the process lives and read
//! further timer commands from stdin. `status`, `sync`, `failed` and
//! `retry-failed` only read the store or work the outbox, so they are safe
//! next to a running session. Tokens for the remote API are read from
//! `TIMELEDGER_ACCESS_TOKEN` and `TIMELEDGER_REFRESH_TOKEN`.

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use timeledger_lib::{init_tracing, Runtime, Tracker, TrackerConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// Local-first time tracker.
#[derive(Parser)]
#[command(name = "timeledger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory (database and payload key)
    #[arg(global = true, long)]
    data_dir: Option<PathBuf>,

    /// Remote API base URL
    #[arg(global = true, long)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the timer and keep tracking until `quit` or Ctrl-C
    Start {
        /// Project to book the new entry on
        #[arg(short, long)]
        project: Option<String>,

        #[arg(short, long)]
        description: Option<String>,
    },
    /// Restore the last session (paused) and keep tracking until `quit` or Ctrl-C
    Run,
    /// Show the saved timer state and sync status
    Status,
    /// Run one sync pass now
    Sync {
        /// Maximum tasks to send
        #[arg(short, long, default_value = "50")]
        max: usize,
    },
    /// List tasks that exhausted their retries
    Failed {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Move failed tasks back to pending
    RetryFailed {
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}

const SESSION_HELP: &str =
    "commands: start [project], pause, resume, stop, status, reset-day, sync, quit";

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}

fn env_token(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn entry_fields(project: Option<String>, description: Option<String>) -> Value {
    let mut fields = Map::new();
    if let Some(project) = project {
        fields.insert("projectId".into(), project.into());
    }
    if let Some(description) = description {
        fields.insert("description".into(), description.into());
    }
    Value::Object(fields)
}

/// One line typed into a running session.
async fn session_command(tracker: &Tracker, line: &str) -> Result<(), String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(());
    };
    match command {
        "start" => {
            let project = words.next().map(String::from);
            tracker
                .start_with(entry_fields(project, None))
                .map_err(|e| e.to_string())
                .and_then(|s| print_json(&s))
        }
        "pause" => tracker
            .pause()
            .map_err(|e| e.to_string())
            .and_then(|s| print_json(&s)),
        "resume" => tracker
            .resume()
            .map_err(|e| e.to_string())
            .and_then(|s| print_json(&s)),
        "stop" => tracker
            .stop()
            .map_err(|e| e.to_string())
            .and_then(|s| print_json(&s)),
        "reset-day" => tracker
            .reset_day()
            .map_err(|e| e.to_string())
            .and_then(|s| print_json(&s)),
        "status" => tracker
            .get_sync_status()
            .map_err(|e| e.to_string())
            .and_then(|status| {
                print_json(&serde_json::json!({
                    "timer": tracker.get_state(),
                    "sync": status,
                }))
            }),
        "sync" => tracker
            .sync_now(timeledger_lib::sync::BACKGROUND_BATCH)
            .await
            .map_err(|e| e.to_string())
            .map(|n| println!("synced {} tasks", n)),
        _ => {
            println!("{}", SESSION_HELP);
            Ok(())
        }
    }
}

/// Read timer commands from stdin until `quit`, Ctrl-C, or a closed stdin
/// followed by Ctrl-C.
async fn session(tracker: Arc<Tracker>) -> Result<(), String> {
    println!("timeledger running, {}", SESSION_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                return signal.map_err(|e| format!("Failed to listen for Ctrl-C: {}", e));
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line == "quit" || line == "exit" {
                        return Ok(());
                    }
                    if let Err(e) = session_command(&tracker, line).await {
                        eprintln!("error: {}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("[CLI] Failed to read stdin, waiting for Ctrl-C: {}", e);
                    stdin_open = false;
                }
            },
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let mut config = TrackerConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(url) = cli.api_url {
        config.sync.api_base_url = url.trim_end_matches('/').to_string();
    }

    let owns_timer = matches!(cli.command, Commands::Start { .. } | Commands::Run);
    let mut runtime = if owns_timer {
        Runtime::bootstrap(config)?
    } else {
        Runtime::open(config)?
    };
    let tracker = runtime.tracker().clone();
    let rt = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    rt.block_on(tracker.set_tokens(
        env_token("TIMELEDGER_ACCESS_TOKEN"),
        env_token("TIMELEDGER_REFRESH_TOKEN"),
    ));

    let result = match cli.command {
        Commands::Start {
            project,
            description,
        } => match tracker.start_with(entry_fields(project, description)) {
            Ok(snapshot) => {
                runtime.spawn_background();
                print_json(&snapshot).and_then(|()| rt.block_on(session(tracker.clone())))
            }
            Err(e) => Err(e.to_string()),
        },
        Commands::Run => {
            runtime.spawn_background();
            rt.block_on(session(tracker.clone()))
        }
        Commands::Status => tracker
            .get_sync_status()
            .map_err(|e| e.to_string())
            .and_then(|status| {
                let timer = tracker.persisted_state().map_err(|e| e.to_string())?;
                print_json(&serde_json::json!({
                    "timer": timer,
                    "sync": status,
                }))
            }),
        Commands::Sync { max } => rt
            .block_on(tracker.sync_now(max))
            .map_err(|e| e.to_string())
            .map(|n| println!("synced {} tasks", n)),
        Commands::Failed { limit } => tracker
            .get_failed_tasks(limit)
            .map_err(|e| e.to_string())
            .and_then(|tasks| print_json(&tasks)),
        Commands::RetryFailed { limit } => tracker
            .retry_failed_tasks(limit)
            .map_err(|e| e.to_string())
            .map(|n| println!("{} tasks back in the queue", n)),
    };

    runtime.shutdown();
    result
}

fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

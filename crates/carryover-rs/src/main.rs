//! Inspect carryover data directories from the command line.
//!
//! # Examples
//!
//! ```sh
//! # List sessions under a data root
//! carryover --dir /var/lib/agent/carryover sessions
//!
//! # Print the latest checkpoint document for a session
//! carryover --dir /var/lib/agent/carryover show --session sess-42
//!
//! # Render the injection block a resuming session would receive
//! carryover --dir /var/lib/agent/carryover render --session sess-42 --resume
//! ```

use std::path::PathBuf;
use std::process;

use carryover_rs::checkpoint::{InjectionReason, render_injection};
use carryover_rs::engine::Engine;
use carryover_rs::state::StateStore;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Inspect carryover state and checkpoint directories.
#[derive(Parser)]
#[command(name = "carryover", version)]
struct Cli {
    /// Data root directory.
    #[arg(long, default_value = ".carryover")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sessions that have stored state or checkpoints.
    Sessions,
    /// Print the latest checkpoint document for a session.
    Show {
        /// Session key.
        #[arg(long)]
        session: String,
    },
    /// Render the latest checkpoint as an injection block.
    Render {
        /// Session key.
        #[arg(long)]
        session: String,
        /// Render the session-resume variant instead of post-compaction.
        #[arg(long)]
        resume: bool,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let engine = Engine::new(&cli.dir);

    let result = match cli.command {
        Command::Sessions => list_sessions(&engine),
        Command::Show { session } => show_latest(&engine, &session),
        Command::Render { session, resume } => render_latest(&engine, &session, resume),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn list_sessions(engine: &Engine) -> Result<(), String> {
    let root = engine.sessions_root();
    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("no sessions under {}", root.display());
            return Ok(());
        }
        Err(e) => return Err(format!("failed to read {}: {e}", root.display())),
    };

    let mut keys: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    keys.sort_unstable();

    for key in keys {
        let state = StateStore::open(engine.state_dir(&key));
        let snapshot = state.snapshot();
        let latest = latest_checkpoint(engine, &key).map(|cp| cp.meta.checkpoint_id);
        println!(
            "{key}: {} decisions, {} open items, {} files, latest checkpoint {}",
            snapshot.decisions.len(),
            snapshot.open_items.len(),
            snapshot.files.len(),
            latest.as_deref().unwrap_or("none"),
        );
    }
    Ok(())
}

fn show_latest(engine: &Engine, session: &str) -> Result<(), String> {
    let checkpoint = latest_checkpoint(engine, session)
        .ok_or_else(|| format!("no checkpoint available for session {session}"))?;
    let json = serde_json::to_string_pretty(&checkpoint)
        .map_err(|e| format!("failed to serialize checkpoint: {e}"))?;
    println!("{json}");
    Ok(())
}

fn render_latest(engine: &Engine, session: &str, resume: bool) -> Result<(), String> {
    let checkpoint = latest_checkpoint(engine, session)
        .ok_or_else(|| format!("no checkpoint available for session {session}"))?;
    let reason = if resume {
        InjectionReason::SessionResume
    } else {
        InjectionReason::PostCompaction
    };
    println!(
        "{}",
        render_injection(&checkpoint, reason, &carryover_rs::checkpoint::RenderOptions::default())
    );
    Ok(())
}

fn latest_checkpoint(
    engine: &Engine,
    session: &str,
) -> Option<carryover_rs::checkpoint::Checkpoint> {
    carryover_rs::checkpoint::CheckpointStore::new(engine.checkpoint_dir(session))
        .ok()?
        .read_latest()
}

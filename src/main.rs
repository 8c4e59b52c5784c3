//! Parley CLI binary entry point.

use clap::Parser;
use parley::cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.command.json_logs());

    match parley::cli::run::run(cli).await {
        Ok(summary) => {
            tracing::info!(
                session_id = %summary.session_id,
                completed = summary.turns_completed,
                interrupted = summary.turns_interrupted,
                failed = summary.turns_failed,
                reason = %summary.end_reason,
                "session finished"
            );
        }
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(hint) = e.recovery_suggestion().hint() {
                eprintln!("Hint: {hint}");
            }
            std::process::exit(1);
        }
    }
}

/// `dev` logs human-readable debug output; `start` logs JSON at info.
/// `RUST_LOG` overrides either.
fn init_tracing(json: bool) {
    let default_level = if json { "info" } else { "parley=debug,info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

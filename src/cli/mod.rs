//! CLI entry point for Parley.

pub mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Parley voice agent
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Parley — LiveKit voice agent")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Run modes.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room with human-readable debug logging
    Dev(RoomArgs),
    /// Join a room with JSON logging at info level
    Start(RoomArgs),
    /// Talk to the agent from the terminal, without a room
    Console(ConsoleArgs),
}

/// Options shared by every mode.
#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Model to use (format: provider:model, e.g., google:gemini-2.0-flash)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Skip the spoken greeting
    #[arg(long)]
    pub no_greeting: bool,
}

/// Arguments for `parley dev` and `parley start`.
#[derive(Args, Debug, Clone)]
pub struct RoomArgs {
    /// Room to join (overrides LIVEKIT_ROOM)
    #[arg(short, long)]
    pub room: Option<String>,

    #[command(flatten)]
    pub agent: AgentArgs,
}

/// Arguments for `parley console`.
#[derive(Args, Debug, Clone)]
pub struct ConsoleArgs {
    /// Write synthesized speech to this WAV file
    #[arg(short, long)]
    pub wav: Option<PathBuf>,

    #[command(flatten)]
    pub agent: AgentArgs,
}

impl Commands {
    /// Whether this mode logs JSON for log collectors.
    pub fn json_logs(&self) -> bool {
        matches!(self, Self::Start(_))
    }

    pub fn agent_args(&self) -> &AgentArgs {
        match self {
            Self::Dev(args) | Self::Start(args) => &args.agent,
            Self::Console(args) => &args.agent,
        }
    }
}

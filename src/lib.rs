//! Parley — voice assistant turn orchestration
//!
//! Wires a real-time audio transport (a LiveKit room with streaming speech
//! recognition), a streaming LLM, and a streaming text-to-speech service into
//! one conversational loop. The [`session::Session`] owns the turn state
//! machine; everything else is a thin client around a hosted service.
//!
//! # Quick Start
//!
//! ```no_run
//! use parley::config::ParleyConfig;
//! use parley::session::{Session, SessionSettings};
//! use parley::transport::ChannelTransport;
//!
//! # async fn example() -> parley::error::Result<()> {
//! let config = ParleyConfig::load(None)?;
//! let (transport, handle) = ChannelTransport::new("demo");
//! let session = Session::new(
//!     Box::new(transport),
//!     parley::provider::create_provider(&config.llm)?,
//!     parley::tts::create_synthesizer(&config.tts)?,
//!     SessionSettings::from_config(&config),
//! );
//! handle.utterance("What's the weather?")?;
//! let summary = session.run().await?;
//! println!("{} turns", summary.turns_completed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod provider;
pub mod session;
pub mod stt;
pub mod transport;
pub mod tts;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;

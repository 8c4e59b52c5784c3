//! Turn orchestration for a single voice conversation.
//!
//! A [`Session`] owns a [`Transport`](crate::transport::Transport), a model
//! provider and a speech synthesizer, and sequences each finalized user
//! utterance through a streaming completion into synthesized playback.

pub mod events;
pub mod hooks;
pub mod orchestrator;
pub mod turn;

pub use events::{SessionEvent, SessionEventPayload, SessionEventSink};
pub use hooks::{BeforeLlmHook, LatestFrameHook, StaticImageHook, VideoSnapshot};
pub use orchestrator::{Session, SessionSettings, SessionState, SessionSummary};
pub use turn::{TurnId, TurnKind};

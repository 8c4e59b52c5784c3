//! Real-time media transports: where user speech comes from and assistant audio goes.

pub mod channel;
#[cfg(feature = "livekit")]
pub mod livekit_room;

pub use channel::{ChannelTransport, ChannelTransportHandle, PlaybackEvent, PlayoutMode};
#[cfg(feature = "livekit")]
pub use livekit_room::LiveKitTransport;

use async_trait::async_trait;

use crate::error::ParleyError;
use crate::stt::SpeechEvent;
use crate::types::AudioFrame;

/// Something that happened on the user's side of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The recognizer closed an utterance.
    UtteranceFinalized { text: String },
    /// Voice activity started.
    UserSpeechStarted,
    /// Partial transcript of the utterance in progress.
    InterimTranscript { text: String },
    /// Everything queued before [`Transport::mark_playout_end`] with this
    /// marker has been played.
    PlayoutFinished { marker: u64 },
    /// The room or the remote participant went away. No events follow.
    Disconnected { reason: String },
}

impl From<SpeechEvent> for TransportEvent {
    fn from(event: SpeechEvent) -> Self {
        match event {
            SpeechEvent::StartOfSpeech => Self::UserSpeechStarted,
            SpeechEvent::InterimTranscript(text) => Self::InterimTranscript { text },
            SpeechEvent::FinalTranscript(text) => Self::UtteranceFinalized { text },
        }
    }
}

/// A connected room.
#[async_trait]
pub trait Transport: Send {
    fn room_name(&self) -> &str;

    /// Wait for the next event.
    ///
    /// Must be cancel-safe: the session polls it inside `tokio::select!`.
    /// After the connection is gone this keeps returning `Disconnected`.
    async fn recv(&mut self) -> TransportEvent;

    /// Queue a frame for playback, after all previously queued frames.
    async fn play(&mut self, frame: AudioFrame) -> Result<(), ParleyError>;

    /// Ask for a [`TransportEvent::PlayoutFinished`] carrying `marker` once
    /// every frame queued so far has been played.
    async fn mark_playout_end(&mut self, marker: u64) -> Result<(), ParleyError>;

    /// Drop queued and buffered playback audio, including pending playout marks.
    async fn clear_playback(&mut self) -> Result<(), ParleyError>;

    async fn close(&mut self) -> Result<(), ParleyError>;
}

//! Speech synthesis: trait, streaming input handles, and Rime clients.

pub mod frames;
pub mod rime;
pub mod rime_stream;

pub use frames::AudioByteStream;
pub use rime::{RimeOptions, RimeTts};
pub use rime_stream::RimeStreamingTts;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::config::TtsSettings;
use crate::error::ParleyError;
use crate::types::AudioFrame;

/// Ordered stream of synthesized frames.
pub type AudioFrameStream = BoxStream<'static, Result<AudioFrame, ParleyError>>;

/// What a synthesizer can do and the audio it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtsCapabilities {
    /// Accepts text incrementally through [`SpeechSynthesizer::stream`].
    pub streaming_input: bool,
    pub sample_rate: u32,
    pub num_channels: u16,
}

/// Text-to-speech client.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn provider_name(&self) -> &str;

    fn capabilities(&self) -> TtsCapabilities;

    /// Synthesize a complete text.
    async fn synthesize(&self, text: &str) -> Result<AudioFrameStream, ParleyError>;

    /// Open a streaming-input synthesis.
    async fn stream(&self) -> Result<SynthesisStream, ParleyError> {
        Err(ParleyError::UnsupportedOperation(format!(
            "{} does not accept streaming input",
            self.provider_name()
        )))
    }
}

/// Commands carried from a [`SynthesisInput`] to the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisCommand {
    Text(String),
    /// Synthesize everything received so far without waiting for more text.
    Flush,
    /// No more text will follow.
    Finish,
}

/// Write half of a streaming synthesis.
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    tx: mpsc::UnboundedSender<SynthesisCommand>,
}

impl SynthesisInput {
    /// Create an input handle and the receiver a synthesizer reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SynthesisCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push_text(&self, text: impl Into<String>) -> Result<(), ParleyError> {
        self.send(SynthesisCommand::Text(text.into()))
    }

    pub fn flush(&self) -> Result<(), ParleyError> {
        self.send(SynthesisCommand::Flush)
    }

    pub fn finish(&self) -> Result<(), ParleyError> {
        self.send(SynthesisCommand::Finish)
    }

    fn send(&self, command: SynthesisCommand) -> Result<(), ParleyError> {
        self.tx
            .send(command)
            .map_err(|_| ParleyError::InvalidState("synthesis stream already closed".into()))
    }
}

/// A streaming synthesis: text goes in through the input, frames come out in order.
pub struct SynthesisStream {
    input: SynthesisInput,
    frames: AudioFrameStream,
}

impl SynthesisStream {
    pub fn new(input: SynthesisInput, frames: AudioFrameStream) -> Self {
        Self { input, frames }
    }

    pub fn input(&self) -> &SynthesisInput {
        &self.input
    }

    pub fn into_parts(self) -> (SynthesisInput, AudioFrameStream) {
        (self.input, self.frames)
    }
}

/// Build the Rime client selected by the settings.
pub fn create_synthesizer(
    settings: &TtsSettings,
) -> Result<Arc<dyn SpeechSynthesizer>, ParleyError> {
    let api_key = settings
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ParleyError::MissingCredential {
            provider: "rime".into(),
        })?;
    let options = RimeOptions::from(settings);
    let http = RimeTts::new(api_key.clone(), options.clone(), settings.base_url.clone());

    if settings.streaming {
        Ok(Arc::new(RimeStreamingTts::new(
            api_key,
            options,
            settings.ws_url.clone(),
            http,
        )))
    } else {
        Ok(Arc::new(http))
    }
}

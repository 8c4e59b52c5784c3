//! Streaming speech recognition.

pub mod deepgram;

pub use deepgram::{DeepgramStt, SttStream, TranscriptAssembler};

/// Recognizer output, already assembled into utterances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    /// Voice activity detected.
    StartOfSpeech,
    /// Best guess so far for the utterance in progress.
    InterimTranscript(String),
    /// The user finished speaking.
    FinalTranscript(String),
}

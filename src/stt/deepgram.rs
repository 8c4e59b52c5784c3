//! Deepgram live transcription over WebSocket.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, trace, warn};

use crate::config::SttSettings;
use crate::error::ParleyError;
use crate::types::AudioFrame;
use crate::util::ws::{map_connect_error, AbortOnDrop, WsStream};

use super::SpeechEvent;

const DEFAULT_URL: &str = "wss://api.deepgram.com/v1/listen";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const UTTERANCE_END_MS: u32 = 1000;

/// Deepgram client; each [`connect`](DeepgramStt::connect) opens one live stream.
#[derive(Clone)]
pub struct DeepgramStt {
    api_key: String,
    settings: SttSettings,
}

impl DeepgramStt {
    pub fn new(settings: &SttSettings) -> Result<Self, ParleyError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ParleyError::MissingCredential {
                provider: "deepgram".into(),
            })?;
        Ok(Self {
            api_key,
            settings: settings.clone(),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.settings.sample_rate
    }

    fn listen_url(&self) -> String {
        let base = self.settings.url.as_deref().unwrap_or(DEFAULT_URL).trim();
        let separator = if base.contains('?') { "&" } else { "?" };
        format!(
            "{base}{separator}model={}&language={}&encoding=linear16&sample_rate={}&channels=1\
             &interim_results=true&vad_events=true&punctuate=true&smart_format=true\
             &endpointing={}&utterance_end_ms={UTTERANCE_END_MS}",
            self.settings.model,
            self.settings.language,
            self.settings.sample_rate,
            self.settings.endpointing_ms,
        )
    }

    /// Open a live transcription stream.
    pub async fn connect(&self) -> Result<SttStream, ParleyError> {
        let url = self.listen_url();
        let mut request = url.as_str().into_client_request().map_err(|error| {
            ParleyError::Configuration(format!("Invalid Deepgram websocket URL: {error}"))
        })?;
        let auth_value = HeaderValue::from_str(&format!("Token {}", self.api_key)).map_err(|error| {
            ParleyError::Configuration(format!("Invalid Deepgram auth header: {error}"))
        })?;
        request.headers_mut().insert("Authorization", auth_value);

        let (socket, _) = connect_async(request)
            .await
            .map_err(|error| map_connect_error("Deepgram", error))?;
        debug!(model = %self.settings.model, "Deepgram stream opened");

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_listen_loop(socket, audio_rx, events_tx));

        Ok(SttStream {
            audio_tx,
            events_rx,
            _task: AbortOnDrop(task),
        })
    }
}

enum AudioCommand {
    Pcm(Vec<u8>),
    Close,
}

/// A live recognition stream: audio in, [`SpeechEvent`]s out.
pub struct SttStream {
    audio_tx: mpsc::UnboundedSender<AudioCommand>,
    events_rx: mpsc::UnboundedReceiver<Result<SpeechEvent, ParleyError>>,
    _task: AbortOnDrop,
}

impl SttStream {
    pub fn push_frame(&self, frame: &AudioFrame) -> Result<(), ParleyError> {
        self.audio_tx
            .send(AudioCommand::Pcm(frame.to_pcm16_le()))
            .map_err(|_| ParleyError::InvalidState("recognition stream closed".into()))
    }

    /// Ask the server to finish pending audio and close.
    pub fn close(&self) {
        let _ = self.audio_tx.send(AudioCommand::Close);
    }

    /// Next event; `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<Result<SpeechEvent, ParleyError>> {
        self.events_rx.recv().await
    }
}

async fn run_listen_loop(
    mut socket: WsStream,
    mut audio_rx: mpsc::UnboundedReceiver<AudioCommand>,
    events_tx: mpsc::UnboundedSender<Result<SpeechEvent, ParleyError>>,
) {
    let mut assembler = TranscriptAssembler::default();
    let mut keepalive = time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;
    let mut audio_open = true;

    loop {
        tokio::select! {
            command = audio_rx.recv(), if audio_open => {
                let message = match command {
                    Some(AudioCommand::Pcm(bytes)) => Message::Binary(bytes.into()),
                    Some(AudioCommand::Close) | None => {
                        audio_open = false;
                        Message::Text(json!({ "type": "CloseStream" }).to_string().into())
                    }
                };
                if let Err(error) = socket.send(message).await {
                    let _ = events_tx.send(Err(ParleyError::Transport(format!(
                        "Deepgram websocket send failed: {error}"
                    ))));
                    return;
                }
            }
            _ = keepalive.tick(), if audio_open => {
                let message = Message::Text(json!({ "type": "KeepAlive" }).to_string().into());
                if let Err(error) = socket.send(message).await {
                    let _ = events_tx.send(Err(ParleyError::Transport(format!(
                        "Deepgram keepalive failed: {error}"
                    ))));
                    return;
                }
            }
            frame = socket.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        let _ = events_tx.send(Err(ParleyError::Transport(format!(
                            "Deepgram websocket receive failed: {error}"
                        ))));
                        return;
                    }
                };

                match serde_json::from_str::<DeepgramMessage>(&text) {
                    Ok(message) => {
                        for event in assembler.handle(message) {
                            if events_tx.send(Ok(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => warn!(%error, "ignoring unparseable Deepgram message"),
                }
            }
        }
    }

    if let Some(event) = assembler.finish() {
        let _ = events_tx.send(Ok(event));
    }
}

/// Server messages on `/v1/listen`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum DeepgramMessage {
    Results(ResultsMessage),
    SpeechStarted,
    UtteranceEnd,
    Metadata,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct ResultsMessage {
    pub channel: ResultsChannel,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub speech_final: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResultsChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
}

/// Joins `is_final` segments into one utterance.
///
/// Deepgram finalizes audio in segments; an utterance ends on `speech_final`
/// (endpointing silence) or an `UtteranceEnd` message.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    segments: Vec<String>,
    speaking: bool,
}

impl TranscriptAssembler {
    pub fn handle(&mut self, message: DeepgramMessage) -> Vec<SpeechEvent> {
        match message {
            DeepgramMessage::SpeechStarted => self.start_speech().into_iter().collect(),
            DeepgramMessage::UtteranceEnd => self.finish().into_iter().collect(),
            DeepgramMessage::Results(results) => self.handle_results(results),
            DeepgramMessage::Metadata | DeepgramMessage::Unknown => Vec::new(),
        }
    }

    /// Emit whatever has been finalized but not yet reported.
    pub fn finish(&mut self) -> Option<SpeechEvent> {
        self.speaking = false;
        let text = self.segments.join(" ");
        self.segments.clear();
        let text = text.trim();
        (!text.is_empty()).then(|| SpeechEvent::FinalTranscript(text.to_string()))
    }

    fn start_speech(&mut self) -> Option<SpeechEvent> {
        if self.speaking {
            return None;
        }
        self.speaking = true;
        Some(SpeechEvent::StartOfSpeech)
    }

    fn handle_results(&mut self, results: ResultsMessage) -> Vec<SpeechEvent> {
        let transcript = results
            .channel
            .alternatives
            .into_iter()
            .next()
            .map(|alt| alt.transcript.trim().to_string())
            .unwrap_or_default();
        trace!(
            is_final = results.is_final,
            speech_final = results.speech_final,
            transcript = %transcript,
            "Deepgram results"
        );

        let mut events = Vec::new();
        if !transcript.is_empty() {
            events.extend(self.start_speech());
        }

        if results.is_final {
            if !transcript.is_empty() {
                self.segments.push(transcript);
            }
        } else if !transcript.is_empty() {
            let mut interim = self.segments.join(" ");
            if !interim.is_empty() {
                interim.push(' ');
            }
            interim.push_str(&transcript);
            events.push(SpeechEvent::InterimTranscript(interim));
        }

        if results.speech_final {
            events.extend(self.finish());
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(transcript: &str, is_final: bool, speech_final: bool) -> DeepgramMessage {
        serde_json::from_value(json!({
            "type": "Results",
            "channel": {"alternatives": [{"transcript": transcript, "confidence": 0.9}]},
            "is_final": is_final,
            "speech_final": speech_final,
        }))
        .unwrap()
    }

    #[test]
    fn final_segments_join_into_one_utterance() {
        let mut assembler = TranscriptAssembler::default();
        assert_eq!(
            assembler.handle(results("what's", false, false)),
            vec![
                SpeechEvent::StartOfSpeech,
                SpeechEvent::InterimTranscript("what's".into())
            ]
        );
        assert!(assembler.handle(results("What's the", true, false)).is_empty());
        assert_eq!(
            assembler.handle(results("wea", false, false)),
            vec![SpeechEvent::InterimTranscript("What's the wea".into())]
        );
        assert_eq!(
            assembler.handle(results("weather?", true, true)),
            vec![SpeechEvent::FinalTranscript("What's the weather?".into())]
        );
    }

    #[test]
    fn utterance_end_flushes_pending_segments() {
        let mut assembler = TranscriptAssembler::default();
        assembler.handle(results("tell me a joke", true, false));
        let events = assembler.handle(DeepgramMessage::UtteranceEnd);
        assert_eq!(
            events,
            vec![SpeechEvent::FinalTranscript("tell me a joke".into())]
        );
        assert!(assembler.handle(DeepgramMessage::UtteranceEnd).is_empty());
    }

    #[test]
    fn silence_results_produce_nothing() {
        let mut assembler = TranscriptAssembler::default();
        assert!(assembler.handle(results("", true, true)).is_empty());
    }

    #[test]
    fn vad_event_reports_speech_once() {
        let mut assembler = TranscriptAssembler::default();
        let started: DeepgramMessage =
            serde_json::from_str(r#"{"type":"SpeechStarted","timestamp":1.2}"#).unwrap();
        assert_eq!(assembler.handle(started), vec![SpeechEvent::StartOfSpeech]);
        assert!(assembler.handle(results("hi", false, false)).len() == 1);
    }

    #[test]
    fn url_carries_endpointing_and_model() {
        let stt = DeepgramStt::new(&SttSettings {
            api_key: Some("dg".into()),
            ..SttSettings::default()
        })
        .unwrap();
        let url = stt.listen_url();
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?model=nova-2-general"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("endpointing=500"));
        assert!(url.contains("vad_events=true"));
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(matches!(
            DeepgramStt::new(&SttSettings::default()),
            Err(ParleyError::MissingCredential { .. })
        ));
    }
}

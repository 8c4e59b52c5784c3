//! Rime text-to-speech over WebSocket (`/ws2`), fed incrementally.

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};

use crate::error::ParleyError;
use crate::types::AudioFrame;
use crate::util::ws::{map_connect_error, AbortOnDrop, WsStream};

use super::frames::AudioByteStream;
use super::rime::{RimeOptions, RimeTts};
use super::{
    AudioFrameStream, SpeechSynthesizer, SynthesisCommand, SynthesisInput, SynthesisStream,
    TtsCapabilities,
};

const DEFAULT_WS_URL: &str = "wss://users.ws.rime.ai/ws2";

/// Streaming-input Rime client. Full-text requests go through HTTP.
#[derive(Debug, Clone)]
pub struct RimeStreamingTts {
    api_key: String,
    options: RimeOptions,
    ws_url: String,
    http: RimeTts,
}

impl RimeStreamingTts {
    pub fn new(api_key: String, options: RimeOptions, ws_url: Option<String>, http: RimeTts) -> Self {
        Self {
            api_key,
            options,
            ws_url: ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            http,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for RimeStreamingTts {
    fn provider_name(&self) -> &str {
        "rime"
    }

    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming_input: true,
            sample_rate: self.options.sample_rate,
            num_channels: 1,
        }
    }

    async fn synthesize(&self, text: &str) -> Result<AudioFrameStream, ParleyError> {
        self.http.synthesize(text).await
    }

    async fn stream(&self) -> Result<SynthesisStream, ParleyError> {
        let url = build_stream_url(&self.ws_url, &self.options)?;
        let socket = connect_rime_socket(&url, &self.api_key).await?;
        debug!(speaker = %self.options.speaker, "Rime stream opened");

        let (input, commands) = SynthesisInput::channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_stream_loop(
            socket,
            commands,
            frames_tx,
            self.options.sample_rate,
        ));

        let mut frames = UnboundedReceiverStream::new(frames_rx);
        let frames = async_stream::stream! {
            let _task = AbortOnDrop(task);
            while let Some(frame) = frames.next().await {
                yield frame;
            }
        };

        Ok(SynthesisStream::new(input, Box::pin(frames)))
    }
}

/// Messages the server sends on `/ws2`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    Chunk {
        data: String,
    },
    Timestamps,
    Done,
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

async fn run_stream_loop(
    mut socket: WsStream,
    mut commands: mpsc::UnboundedReceiver<SynthesisCommand>,
    frames_tx: mpsc::UnboundedSender<Result<AudioFrame, ParleyError>>,
    sample_rate: u32,
) {
    let mut chunker = AudioByteStream::with_default_frame_size(sample_rate, 1);
    let mut input_open = true;

    loop {
        tokio::select! {
            command = commands.recv(), if input_open => {
                let payload = match command {
                    Some(SynthesisCommand::Text(text)) => json!({ "text": text }),
                    Some(SynthesisCommand::Flush) => json!({ "operation": "flush" }),
                    Some(SynthesisCommand::Finish) | None => {
                        input_open = false;
                        json!({ "operation": "eos" })
                    }
                };
                if let Err(error) = socket.send(Message::Text(payload.to_string().into())).await {
                    let _ = frames_tx.send(Err(ParleyError::Stream(format!(
                        "Rime websocket send failed: {error}"
                    ))));
                    return;
                }
            }
            frame = socket.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(error)) => {
                        let _ = frames_tx.send(Err(ParleyError::Stream(format!(
                            "Rime websocket receive failed: {error}"
                        ))));
                        return;
                    }
                    None => break,
                };
                let text = match message {
                    Message::Text(text) => text.to_string(),
                    Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Message::Ping(payload) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Message::Close(_) => break,
                    Message::Pong(_) | Message::Frame(_) => continue,
                };

                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::Chunk { data }) => {
                        let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
                            Ok(bytes) => bytes,
                            Err(error) => {
                                let _ = frames_tx.send(Err(ParleyError::Stream(format!(
                                    "Rime sent invalid base64 audio: {error}"
                                ))));
                                return;
                            }
                        };
                        for frame in chunker.push(&bytes) {
                            if frames_tx.send(Ok(frame)).is_err() {
                                let _ = socket.send(Message::Close(None)).await;
                                return;
                            }
                        }
                    }
                    Ok(ServerMessage::Done) => break,
                    Ok(ServerMessage::Error { message }) => {
                        let _ = frames_tx.send(Err(ParleyError::provider("rime", message)));
                        return;
                    }
                    Ok(ServerMessage::Timestamps) | Ok(ServerMessage::Unknown) => {}
                    Err(error) => warn!(%error, "ignoring unparseable Rime message"),
                }
            }
        }
    }

    if let Some(frame) = chunker.flush() {
        let _ = frames_tx.send(Ok(frame));
    }
    let _ = socket.send(Message::Close(None)).await;
}

fn build_stream_url(base: &str, options: &RimeOptions) -> Result<String, ParleyError> {
    let trimmed = base.trim();
    if trimmed.is_empty() {
        return Err(ParleyError::Configuration(
            "Rime websocket URL cannot be empty".into(),
        ));
    }
    let separator = if trimmed.contains('?') { "&" } else { "?" };
    Ok(format!(
        "{trimmed}{separator}speaker={}&modelId={}&audioFormat=pcm&samplingRate={}&speedAlpha={}\
         &reduceLatency={}&pauseBetweenBrackets={}&phonemizeBetweenBrackets={}",
        options.speaker,
        options.model,
        options.sample_rate,
        options.speed_alpha,
        options.reduce_latency,
        options.pause_between_brackets,
        options.phonemize_between_brackets,
    ))
}

async fn connect_rime_socket(url: &str, api_key: &str) -> Result<WsStream, ParleyError> {
    let mut request = url.into_client_request().map_err(|error| {
        ParleyError::Configuration(format!("Invalid Rime websocket URL: {error}"))
    })?;
    let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|error| {
        ParleyError::Configuration(format!("Invalid Rime auth header: {error}"))
    })?;
    request.headers_mut().insert("Authorization", auth_value);

    connect_async(request)
        .await
        .map(|(socket, _)| socket)
        .map_err(|error| map_connect_error("Rime", error))
}

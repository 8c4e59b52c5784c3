//! Rime text-to-speech over HTTP.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT};
use serde::Serialize;
use tracing::debug;

use crate::config::TtsSettings;
use crate::error::ParleyError;
use crate::provider::http::{bearer_headers, shared_client, status_to_error, trim_trailing_slash};

use super::frames::AudioByteStream;
use super::{AudioFrameStream, SpeechSynthesizer, TtsCapabilities};

const DEFAULT_BASE_URL: &str = "https://users.rime.ai";

/// Voice options shared by the HTTP and WebSocket clients.
#[derive(Debug, Clone, PartialEq)]
pub struct RimeOptions {
    pub model: String,
    pub speaker: String,
    pub speed_alpha: f32,
    pub reduce_latency: bool,
    pub pause_between_brackets: bool,
    pub phonemize_between_brackets: bool,
    pub sample_rate: u32,
}

impl From<&TtsSettings> for RimeOptions {
    fn from(settings: &TtsSettings) -> Self {
        Self {
            model: settings.model.clone(),
            speaker: settings.speaker.clone(),
            speed_alpha: settings.speed_alpha,
            reduce_latency: settings.reduce_latency,
            pause_between_brackets: settings.pause_between_brackets,
            phonemize_between_brackets: settings.phonemize_between_brackets,
            sample_rate: settings.sample_rate,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RimeRequest<'a> {
    speaker: &'a str,
    text: &'a str,
    model_id: &'a str,
    sampling_rate: u32,
    speed_alpha: f32,
    reduce_latency: bool,
    pause_between_brackets: bool,
    phonemize_between_brackets: bool,
}

/// Full-text synthesis against `POST /v1/rime-tts`.
#[derive(Debug, Clone)]
pub struct RimeTts {
    api_key: String,
    options: RimeOptions,
    base_url: String,
}

impl RimeTts {
    pub fn new(api_key: String, options: RimeOptions, base_url: Option<String>) -> Self {
        Self {
            api_key,
            options,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn options(&self) -> &RimeOptions {
        &self.options
    }
}

#[async_trait]
impl SpeechSynthesizer for RimeTts {
    fn provider_name(&self) -> &str {
        "rime"
    }

    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming_input: false,
            sample_rate: self.options.sample_rate,
            num_channels: 1,
        }
    }

    async fn synthesize(&self, text: &str) -> Result<AudioFrameStream, ParleyError> {
        if text.trim().is_empty() {
            return Err(ParleyError::InvalidArgument(
                "cannot synthesize empty text".into(),
            ));
        }

        let url = format!("{}/v1/rime-tts", trim_trailing_slash(&self.base_url));
        let body = RimeRequest {
            speaker: &self.options.speaker,
            text,
            model_id: &self.options.model,
            sampling_rate: self.options.sample_rate,
            speed_alpha: self.options.speed_alpha,
            reduce_latency: self.options.reduce_latency,
            pause_between_brackets: self.options.pause_between_brackets,
            phonemize_between_brackets: self.options.phonemize_between_brackets,
        };

        debug!(
            speaker = %self.options.speaker,
            model = %self.options.model,
            chars = text.len(),
            "Rime synthesize"
        );

        let mut headers = bearer_headers(&self.api_key);
        headers.insert(ACCEPT, HeaderValue::from_static("audio/pcm"));

        let resp = shared_client()
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body_text));
        }

        let sample_rate = self.options.sample_rate;
        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut chunker = AudioByteStream::with_default_frame_size(sample_rate, 1);
            futures::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for frame in chunker.push(&bytes) {
                            yield Ok(frame);
                        }
                    }
                    Err(e) => {
                        yield Err(ParleyError::Network(e));
                        return;
                    }
                }
            }
            if let Some(frame) = chunker.flush() {
                yield Ok(frame);
            }
        };

        Ok(Box::pin(stream))
    }
}

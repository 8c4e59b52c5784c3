//! OpenAI Chat Completions API provider.
//!
//! Also serves any server speaking the same wire format when constructed with
//! a custom base URL and provider name.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::ParleyError;
use crate::types::*;

use super::http::{
    bearer_headers, parse_sse_data, shared_client, status_to_error, trim_trailing_slash,
    SseLineBuffer,
};
use super::{ModelProvider, ProviderRequest, TextDeltaStream};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    provider_name: String,
    model_id: String,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(model_id: impl Into<String>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            provider_name: "openai".to_string(),
            model_id: model_id.into(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    /// Report a different provider name (used for compatible servers).
    pub fn with_provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    fn build_request_body(&self, request: &ProviderRequest) -> serde_json::Value {
        let messages = request
            .messages
            .iter()
            .map(message_to_openai)
            .collect::<Vec<_>>();

        let mut obj = serde_json::Map::new();
        obj.insert("model".into(), self.model_id.clone().into());
        obj.insert("messages".into(), messages.into());
        obj.insert("stream".into(), true.into());

        if let Some(max) = request.settings.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = request.settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = request.settings.stop_sequences {
            obj.insert("stop".into(), serde_json::json!(stops));
        }

        serde_json::Value::Object(obj)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream_text(&self, request: &ProviderRequest) -> Result<TextDeltaStream, ParleyError> {
        let body = self.build_request_body(request);
        let url = format!("{}/chat/completions", trim_trailing_slash(&self.base_url));

        debug!(
            provider = %self.provider_name,
            model = %self.model_id,
            messages = request.messages.len(),
            "OpenAI stream_text"
        );

        let resp = shared_client()
            .post(&url)
            .headers(bearer_headers(&self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body_text));
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = SseLineBuffer::new();
            futures::pin_mut!(byte_stream);

            'read: loop {
                let (pending, eof) = match byte_stream.next().await {
                    Some(Ok(chunk)) => (lines.push(&chunk), false),
                    Some(Err(e)) => {
                        yield Err(ParleyError::Network(e));
                        break 'read;
                    }
                    None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
                };

                for line in pending {
                    let Some(data) = parse_sse_data(&line) else { continue };
                    for delta in parse_openai_chunk(data) {
                        let stop = delta.is_err()
                            || matches!(&delta, Ok(d) if d.event_type == StreamEventType::Done);
                        yield delta;
                        if stop {
                            break 'read;
                        }
                    }
                }

                if eof {
                    break 'read;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn parse_openai_chunk(data: &str) -> Vec<Result<TextStreamDelta, ParleyError>> {
    let chunk = match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => return vec![Err(ParleyError::Serialization(e))],
    };

    if let Some(error) = chunk.error {
        return vec![Err(ParleyError::provider("openai", error.message))];
    }

    let usage = chunk.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    let mut deltas = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            deltas.push(Ok(TextStreamDelta::text(text)));
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(Ok(TextStreamDelta::done(
                FinishReason::from_vendor(&reason),
                usage,
            )));
        }
    }
    deltas
}

fn message_to_openai(msg: &ChatMessage) -> serde_json::Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    if let [ContentPart::Text { text }] = msg.content.as_slice() {
        return serde_json::json!({ "role": role, "content": text });
    }

    let parts: Vec<serde_json::Value> = msg
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => serde_json::json!({
                "type": "text",
                "text": text,
            }),
            ContentPart::Image(img) => serde_json::json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", img.mime_type, img.data) }
            }),
        })
        .collect();

    serde_json::json!({ "role": role, "content": parts })
}

// OpenAI API response types (internal)

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiError>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiError {
    message: String,
}

//! Google Gemini API provider.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::ParleyError;
use crate::types::*;

use super::http::{parse_sse_data, shared_client, status_to_error, trim_trailing_slash, SseLineBuffer};
use super::{ModelProvider, ProviderRequest, TextDeltaStream};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    model_id: String,
    api_key: String,
    base_url: String,
}

impl GoogleProvider {
    pub fn new(model_id: impl Into<String>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            api_key,
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
        }
    }

    fn build_request_body(&self, request: &ProviderRequest) -> serde_json::Value {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    system_parts.push(serde_json::json!({ "text": msg.text() }));
                }
                Role::User => {
                    contents.push(serde_json::json!({
                        "role": "user",
                        "parts": build_gemini_parts(&msg.content),
                    }));
                }
                Role::Assistant => {
                    contents.push(serde_json::json!({
                        "role": "model",
                        "parts": [{"text": msg.text()}],
                    }));
                }
            }
        }

        let mut body = serde_json::Map::new();
        body.insert("contents".into(), serde_json::Value::Array(contents));

        if !system_parts.is_empty() {
            body.insert(
                "systemInstruction".into(),
                serde_json::json!({ "parts": system_parts }),
            );
        }

        let mut gen_config = serde_json::Map::new();
        if let Some(max) = request.settings.max_tokens {
            gen_config.insert("maxOutputTokens".into(), max.into());
        }
        if let Some(temp) = request.settings.temperature {
            gen_config.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = request.settings.top_p {
            gen_config.insert("topP".into(), top_p.into());
        }
        if let Some(ref stops) = request.settings.stop_sequences {
            gen_config.insert("stopSequences".into(), serde_json::json!(stops));
        }
        if !gen_config.is_empty() {
            body.insert("generationConfig".into(), serde_json::Value::Object(gen_config));
        }

        serde_json::Value::Object(body)
    }
}

#[async_trait]
impl ModelProvider for GoogleProvider {
    fn provider_name(&self) -> &str {
        "google"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream_text(&self, request: &ProviderRequest) -> Result<TextDeltaStream, ParleyError> {
        let body = self.build_request_body(request);
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            trim_trailing_slash(&self.base_url),
            self.model_id,
        );

        debug!(model = %self.model_id, messages = request.messages.len(), "Google stream_text");

        let resp = shared_client()
            .post(&url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
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
                    for delta in parse_gemini_chunk(data) {
                        let failed = delta.is_err();
                        yield delta;
                        if failed {
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

/// Turn one SSE payload into zero or more deltas.
fn parse_gemini_chunk(data: &str) -> Vec<Result<TextStreamDelta, ParleyError>> {
    let chunk = match serde_json::from_str::<GeminiStreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => return vec![Err(ParleyError::Serialization(e))],
    };

    if let Some(error) = chunk.error {
        return vec![Err(ParleyError::provider("google", error.message))];
    }

    let usage = chunk.usage_metadata.map(|u| Usage {
        input_tokens: u.prompt_token_count,
        output_tokens: u.candidates_token_count,
        total_tokens: u.total_token_count,
    });

    let mut deltas = Vec::new();
    if let Some(candidate) = chunk.candidates.into_iter().next() {
        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();
        if !text.is_empty() {
            deltas.push(Ok(TextStreamDelta::text(text)));
        }
        if let Some(reason) = candidate.finish_reason {
            deltas.push(Ok(TextStreamDelta::done(
                FinishReason::from_vendor(&reason),
                usage,
            )));
        }
    }
    deltas
}

fn build_gemini_parts(content: &[ContentPart]) -> Vec<serde_json::Value> {
    content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => serde_json::json!({"text": text}),
            ContentPart::Image(img) => serde_json::json!({
                "inlineData": {
                    "mimeType": img.mime_type,
                    "data": img.data,
                }
            }),
        })
        .collect()
}

// Internal Gemini response types

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Deserialize)]
struct GeminiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_and_roles_map_to_gemini_shape() {
        let provider = GoogleProvider::new("gemini-2.0-flash", "k".into(), None);
        let request = ProviderRequest::new(vec![
            ChatMessage::system("You are a joke generator."),
            ChatMessage::user("Tell me about the news"),
            ChatMessage::assistant("Here's one"),
            ChatMessage::user_image("aGVsbG8=", "image/jpeg"),
        ])
        .with_settings(GenerationSettings::builder().temperature(0.7).build());

        let body = provider.build_request_body(&request);

        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "You are a joke generator."
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(body["generationConfig"]["temperature"], 0.7);
    }

    #[test]
    fn final_chunk_yields_text_then_done() {
        let deltas = parse_gemini_chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":" today."}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":3,"totalTokenCount":7}}"#,
        );
        assert_eq!(deltas.len(), 2);
        let text = deltas[0].as_ref().unwrap();
        assert_eq!(text.text, " today.");
        let done = deltas[1].as_ref().unwrap();
        assert_eq!(done.event_type, StreamEventType::Done);
        assert_eq!(done.usage.as_ref().map(|u| u.total_tokens), Some(7));
    }

    #[test]
    fn malformed_chunk_is_an_error() {
        let deltas = parse_gemini_chunk("{oops");
        assert!(matches!(deltas[0], Err(ParleyError::Serialization(_))));
    }
}

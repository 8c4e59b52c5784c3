//! Language model provider trait and implementations.

pub mod http;

#[cfg(feature = "google")]
pub mod google;

#[cfg(feature = "openai")]
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::LlmSettings;
use crate::error::ParleyError;
use crate::models::ProviderKey;
use crate::types::{ChatMessage, GenerationSettings, TextStreamDelta};

/// Stream of incremental completion deltas.
pub type TextDeltaStream = BoxStream<'static, Result<TextStreamDelta, ParleyError>>;

/// A request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub settings: GenerationSettings,
}

impl ProviderRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Streaming completion client for one model.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "google", "openai").
    fn provider_name(&self) -> &str;

    /// The model ID this provider instance serves.
    fn model_id(&self) -> &str;

    /// Start a streaming completion.
    ///
    /// Errors before the first byte are returned directly; errors after the
    /// stream started arrive as `Err` items.
    async fn stream_text(&self, request: &ProviderRequest) -> Result<TextDeltaStream, ParleyError>;
}

/// Create the provider selected by the LLM settings.
pub fn create_provider(settings: &LlmSettings) -> Result<Arc<dyn ModelProvider>, ParleyError> {
    let model = &settings.model;
    let api_key = || {
        settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ParleyError::MissingCredential {
                provider: model.provider_name().to_string(),
            })
    };

    match model.provider() {
        #[cfg(feature = "google")]
        ProviderKey::Google => Ok(Arc::new(google::GoogleProvider::new(
            model.model_id(),
            api_key()?,
            settings.base_url.clone(),
        ))),
        #[cfg(feature = "openai")]
        ProviderKey::OpenAi => Ok(Arc::new(openai::OpenAiProvider::new(
            model.model_id(),
            api_key()?,
            settings.base_url.clone(),
        ))),
        #[cfg(feature = "openai")]
        ProviderKey::OpenAiCompatible => {
            let base_url = settings.base_url.clone().ok_or_else(|| {
                ParleyError::Configuration(
                    "openai-compatible models need llm.base_url (or OPENAI_BASE_URL)".into(),
                )
            })?;
            Ok(Arc::new(
                openai::OpenAiProvider::new(model.model_id(), api_key()?, Some(base_url))
                    .with_provider_name(ProviderKey::OpenAiCompatible.as_str()),
            ))
        }
        #[allow(unreachable_patterns)]
        _ => Err(ParleyError::ModelNotFound(format!(
            "Provider for model '{model}' not enabled via feature flags"
        ))),
    }
}

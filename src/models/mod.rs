//! Model identifiers.

pub mod provider_key;

pub use provider_key::ProviderKey;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParleyError;

/// Gemini model the voice agent was tuned against.
pub const DEFAULT_MODEL: &str = "google:gemini-2.0-flash";

/// A language model selected as `provider:model_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageModel {
    provider: ProviderKey,
    model_id: String,
}

impl LanguageModel {
    pub fn new(provider: ProviderKey, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
        }
    }

    pub fn provider(&self) -> ProviderKey {
        self.provider
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.as_str()
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Default for LanguageModel {
    fn default() -> Self {
        Self::new(ProviderKey::Google, "gemini-2.0-flash")
    }
}

impl FromStr for LanguageModel {
    type Err = ParleyError;

    /// Parse "provider:model_id", e.g. "google:gemini-2.0-flash" or "openai:gpt-4o-mini".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model_id) = s.split_once(':').ok_or_else(|| {
            ParleyError::InvalidArgument(format!(
                "Invalid model selector '{s}': expected 'provider:model_id'"
            ))
        })?;
        let provider = ProviderKey::parse(provider)
            .ok_or_else(|| ParleyError::ModelNotFound(format!("Unknown provider '{provider}'")))?;
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(ParleyError::InvalidArgument(format!(
                "Invalid model selector '{s}': model id cannot be empty"
            )));
        }
        Ok(Self::new(provider, model_id))
    }
}

impl TryFrom<String> for LanguageModel {
    type Error = ParleyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LanguageModel> for String {
    fn from(model: LanguageModel) -> Self {
        model.to_string()
    }
}

impl fmt::Display for LanguageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_name(), self.model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_round_trips_through_display() {
        let model: LanguageModel = DEFAULT_MODEL.parse().unwrap();
        assert_eq!(model, LanguageModel::default());
        assert_eq!(model.to_string(), DEFAULT_MODEL);
    }

    #[test]
    fn aliases_resolve_to_canonical_provider() {
        let model: LanguageModel = "gemini:gemini-2.0-flash-thinking-exp-01-21".parse().unwrap();
        assert_eq!(model.provider(), ProviderKey::Google);
        assert_eq!(model.model_id(), "gemini-2.0-flash-thinking-exp-01-21");
    }

    #[test]
    fn missing_separator_is_invalid_argument() {
        let err = "gpt-4o".parse::<LanguageModel>().unwrap_err();
        assert!(matches!(err, ParleyError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_provider_is_model_not_found() {
        let err = "anthropic:claude".parse::<LanguageModel>().unwrap_err();
        assert!(matches!(err, ParleyError::ModelNotFound(_)));
    }

    #[test]
    fn empty_model_id_is_rejected() {
        assert!("openai: ".parse::<LanguageModel>().is_err());
    }
}

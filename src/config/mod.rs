//! Configuration system (layered: defaults < TOML file < .env < env < CLI).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ParleyError;
use crate::models::LanguageModel;

/// Default system prompt shipped with the agent.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../../prompts/joke_generator.md");

/// Greeting spoken right after joining a room.
pub const DEFAULT_GREETING: &str = "What's up with you lately? Tell me a story";

/// Top-level configuration for a Parley agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub livekit: LiveKitSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,
    pub stt: SttSettings,
    pub agent: AgentSettings,
}

/// Room connection settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveKitSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Pre-minted access token; takes precedence over key/secret.
    pub token: Option<String>,
    pub room: Option<String>,
    pub identity: String,
    /// Lifetime of minted tokens, in seconds.
    pub token_ttl_secs: u64,
}

impl Default for LiveKitSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            api_secret: None,
            token: None,
            room: None,
            identity: "parley-agent".to_string(),
            token_ttl_secs: 6 * 60 * 60,
        }
    }
}

impl fmt::Debug for LiveKitSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitSettings")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &redacted(&self.api_secret))
            .field("token", &redacted(&self.token))
            .field("room", &self.room)
            .field("identity", &self.identity)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

/// Language model settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: LanguageModel,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Upper bound on one completion request, first byte to last token.
    pub timeout_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: LanguageModel::default(),
            api_key: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
            timeout_ms: 30_000,
        }
    }
}

impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("model", &self.model.to_string())
            .field("api_key", &redacted(&self.api_key))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Rime speech synthesis settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub speaker: String,
    pub speed_alpha: f32,
    pub reduce_latency: bool,
    pub pause_between_brackets: bool,
    pub phonemize_between_brackets: bool,
    pub sample_rate: u32,
    /// Use the WebSocket endpoint so synthesis starts before the reply is complete.
    pub streaming: bool,
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "mistv2".to_string(),
            speaker: "cove".to_string(),
            speed_alpha: 0.9,
            reduce_latency: true,
            pause_between_brackets: true,
            phonemize_between_brackets: true,
            sample_rate: 24_000,
            streaming: true,
            base_url: None,
            ws_url: None,
            timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for TtsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtsSettings")
            .field("api_key", &redacted(&self.api_key))
            .field("model", &self.model)
            .field("speaker", &self.speaker)
            .field("speed_alpha", &self.speed_alpha)
            .field("reduce_latency", &self.reduce_latency)
            .field("sample_rate", &self.sample_rate)
            .field("streaming", &self.streaming)
            .field("base_url", &self.base_url)
            .field("ws_url", &self.ws_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Deepgram speech recognition settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub language: String,
    /// Silence (ms) before the recognizer closes an utterance.
    pub endpointing_ms: u32,
    pub sample_rate: u32,
    pub url: Option<String>,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "nova-2-general".to_string(),
            language: "en-US".to_string(),
            endpointing_ms: 500,
            sample_rate: 16_000,
            url: None,
        }
    }
}

impl fmt::Debug for SttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SttSettings")
            .field("api_key", &redacted(&self.api_key))
            .field("model", &self.model)
            .field("language", &self.language)
            .field("endpointing_ms", &self.endpointing_ms)
            .field("sample_rate", &self.sample_rate)
            .field("url", &self.url)
            .finish()
    }
}

/// What to do with a finalized utterance that arrives while a turn is active.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OverlapPolicy {
    /// Cancel the active turn and answer the new utterance.
    #[default]
    Interrupt,
    /// Answer utterances one after another.
    Queue,
}

/// Conversation behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub system_prompt: String,
    /// Spoken once after joining; `None` disables it.
    pub greeting: Option<String>,
    pub overlap_policy: OverlapPolicy,
    /// Barge-in threshold. Zero interrupts as soon as speech starts; otherwise
    /// an interim transcript needs at least this many words.
    pub interrupt_min_words: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.trim().to_string(),
            greeting: Some(DEFAULT_GREETING.to_string()),
            overlap_policy: OverlapPolicy::Interrupt,
            interrupt_min_words: 0,
        }
    }
}

impl ParleyConfig {
    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ParleyError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ParleyError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ParleyError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Platform config file location (`~/.config/parley/config.toml` on Linux).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "parley", "parley")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the full layered configuration.
    ///
    /// An explicit path must exist; the platform default is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ParleyError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "loading config file");
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };

        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay process environment variables.
    pub fn apply_env(&mut self) -> Result<(), ParleyError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary lookup (tests pass a map).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ParleyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("LIVEKIT_URL") {
            self.livekit.url = Some(url);
        }
        if let Some(key) = get("LIVEKIT_API_KEY") {
            self.livekit.api_key = Some(key);
        }
        if let Some(secret) = get("LIVEKIT_API_SECRET") {
            self.livekit.api_secret = Some(secret);
        }
        if let Some(token) = get("LIVEKIT_TOKEN") {
            self.livekit.token = Some(token);
        }
        if let Some(room) = get("LIVEKIT_ROOM") {
            self.livekit.room = Some(room);
        }

        if let Some(model) = get("PARLEY_LLM_MODEL") {
            self.llm.model = model.parse()?;
        }
        if self.llm.api_key.is_none() {
            self.llm.api_key = self
                .llm
                .model
                .provider()
                .api_key_env_vars()
                .iter()
                .find_map(|var| get(var));
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            if self.llm.model.provider() != crate::models::ProviderKey::Google {
                self.llm.base_url = Some(url);
            }
        }

        if let Some(key) = get("RIME_API_KEY") {
            self.tts.api_key = Some(key);
        }
        if let Some(key) = get("DEEPGRAM_API_KEY") {
            self.stt.api_key = Some(key);
        }
        Ok(())
    }

    /// Switch to another model (the `--model` flag). A different provider
    /// drops the previous key and looks up the new provider's variables.
    pub fn override_model(&mut self, model: LanguageModel) {
        if model.provider() != self.llm.model.provider() {
            self.llm.api_key = model
                .provider()
                .api_key_env_vars()
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()));
            self.llm.base_url = None;
        }
        self.llm.model = model;
    }

    /// Check the credentials a session needs. Room settings are checked by
    /// the LiveKit transport, since console mode runs without a room.
    pub fn validate(&self) -> Result<(), ParleyError> {
        if self.llm.api_key.is_none() {
            return Err(ParleyError::MissingCredential {
                provider: self.llm.model.provider_name().to_string(),
            });
        }
        if self.tts.api_key.is_none() {
            return Err(ParleyError::MissingCredential {
                provider: "rime".to_string(),
            });
        }
        if self.llm.timeout_ms == 0 || self.tts.timeout_ms == 0 {
            return Err(ParleyError::Configuration(
                "timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_shipped_agent() {
        let config = ParleyConfig::default();
        assert_eq!(config.llm.model.to_string(), "google:gemini-2.0-flash");
        assert_eq!(config.tts.model, "mistv2");
        assert_eq!(config.tts.speaker, "cove");
        assert_eq!(config.stt.endpointing_ms, 500);
        assert_eq!(config.agent.overlap_policy, OverlapPolicy::Interrupt);
        assert_eq!(config.agent.greeting.as_deref(), Some(DEFAULT_GREETING));
        assert!(!config.agent.system_prompt.is_empty());
    }

    #[test]
    fn toml_overrides_only_given_fields() {
        let config = ParleyConfig::from_toml_str(
            r#"
            [llm]
            model = "openai:gpt-4o-mini"
            timeout_ms = 5000

            [agent]
            overlap_policy = "queue"
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.model.to_string(), "openai:gpt-4o-mini");
        assert_eq!(config.llm.timeout_ms, 5000);
        assert_eq!(config.agent.overlap_policy, OverlapPolicy::Queue);
        assert_eq!(config.tts.sample_rate, 24_000);
    }

    #[test]
    fn bad_model_in_toml_is_configuration_error() {
        let err = ParleyConfig::from_toml_str("[llm]\nmodel = \"nope\"").unwrap_err();
        assert!(matches!(err, ParleyError::Configuration(_)));
    }

    #[test]
    fn env_fills_keys_for_the_selected_provider() {
        let mut config = ParleyConfig::default();
        config
            .apply_env_with(env(&[
                ("GEMINI_API_KEY", "g-key"),
                ("OPENAI_API_KEY", "o-key"),
                ("RIME_API_KEY", "r-key"),
                ("LIVEKIT_ROOM", "lobby"),
            ]))
            .unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("g-key"));
        assert_eq!(config.tts.api_key.as_deref(), Some("r-key"));
        assert_eq!(config.livekit.room.as_deref(), Some("lobby"));
        config.validate().unwrap();
    }

    #[test]
    fn model_override_changes_key_lookup() {
        let mut config = ParleyConfig::default();
        config
            .apply_env_with(env(&[
                ("PARLEY_LLM_MODEL", "openai:gpt-4o-mini"),
                ("GOOGLE_API_KEY", "g-key"),
                ("OPENAI_API_KEY", "o-key"),
                ("OPENAI_BASE_URL", "http://localhost:1234/v1"),
            ]))
            .unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("o-key"));
        assert_eq!(config.llm.base_url.as_deref(), Some("http://localhost:1234/v1"));
    }

    #[test]
    fn missing_tts_key_fails_validation() {
        let mut config = ParleyConfig::default();
        config.llm.api_key = Some("k".into());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ParleyError::MissingCredential { provider } if provider == "rime"));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let mut config = ParleyConfig::default();
        config.llm.api_key = Some("sk-secret".into());
        config.livekit.api_secret = Some("lk-secret".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("lk-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn overlap_policy_parses_case_insensitively() {
        assert_eq!("Queue".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Queue);
        assert_eq!(OverlapPolicy::Interrupt.to_string(), "interrupt");
    }
}

//! Typed provider identifiers and alias handling.

/// Canonical LLM provider keys used across model parsing, config, and provider wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKey {
    Google,
    OpenAi,
    OpenAiCompatible,
}

impl ProviderKey {
    /// Canonical provider key string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai-compatible",
        }
    }

    /// Parse user-facing provider aliases into a typed provider key.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "google" | "gemini" => Some(Self::Google),
            "openai" => Some(Self::OpenAi),
            "openai-compatible" | "openai_compatible" | "compat" => Some(Self::OpenAiCompatible),
            _ => None,
        }
    }

    /// Environment variables that may hold the API key, in priority order.
    pub const fn api_key_env_vars(self) -> &'static [&'static str] {
        match self {
            Self::Google => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
            Self::OpenAi => &["OPENAI_API_KEY"],
            Self::OpenAiCompatible => &["OPENAI_COMPAT_API_KEY", "OPENAI_API_KEY"],
        }
    }
}

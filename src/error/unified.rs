//! Error classification and recovery.

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Timeout,
    Server,
    Api,
    Configuration,
    Serialization,
    Transport,
    Unknown,
}

/// What a failure takes down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Abort the current turn and go back to listening.
    Turn,
    /// Terminate the whole session.
    Session,
}

/// Suggested recovery action, surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryLater,
    CheckCredentials,
    CheckConfiguration,
    CheckConnectivity,
    IncreaseTimeout,
    Reconnect,
    None,
}

impl RecoverySuggestion {
    /// One-line hint for log and terminal output.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            Self::RetryLater => Some("the vendor is throttling or unavailable; try again later"),
            Self::CheckCredentials => Some("check the API keys in your environment or .env file"),
            Self::CheckConfiguration => Some("check the config file and environment overrides"),
            Self::CheckConnectivity => Some("check network connectivity to the vendor endpoint"),
            Self::IncreaseTimeout => Some("raise the timeout in the config file"),
            Self::Reconnect => Some("the room connection was lost; start the agent again"),
            Self::None => None,
        }
    }
}

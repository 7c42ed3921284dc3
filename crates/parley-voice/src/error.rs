use parley_audio::CodecError;
use parley_types::GuildId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Pipeline phase in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Decode,
    Recognition,
    Routing,
    Synthesis,
    Playback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Decode => "decode",
            Self::Recognition => "recognition",
            Self::Routing => "routing",
            Self::Synthesis => "synthesis",
            Self::Playback => "playback",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of failure kinds surfaced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineErrorKind {
    TransportUnavailable,
    ProviderUnavailable,
    ProviderRateLimited,
    ProviderTimeout,
    /// Authentication failure or a request the provider refused outright.
    ProviderRejected,
    MalformedAudio,
    AgentTimeout,
    DisconnectedMidOperation,
}

impl PipelineErrorKind {
    /// Whether a failure of this kind may succeed when the call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable | Self::ProviderRateLimited | Self::ProviderTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportUnavailable => "transport_unavailable",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ProviderRateLimited => "provider_rate_limited",
            Self::ProviderTimeout => "provider_timeout",
            Self::ProviderRejected => "provider_rejected",
            Self::MalformedAudio => "malformed_audio",
            Self::AgentTimeout => "agent_timeout",
            Self::DisconnectedMidOperation => "disconnected_mid_operation",
        }
    }
}

impl fmt::Display for PipelineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that reached the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} during {phase} in guild {guild}: {detail}")]
pub struct PipelineError {
    pub kind: PipelineErrorKind,
    pub guild: GuildId,
    pub phase: Phase,
    pub detail: String,
}

impl PipelineError {
    pub fn new(
        kind: PipelineErrorKind,
        guild: GuildId,
        phase: Phase,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            guild,
            phase,
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Disconnects are expected and never count against the session.
    pub fn counts_against_session(&self) -> bool {
        self.kind != PipelineErrorKind::DisconnectedMidOperation
    }

    pub fn from_provider(guild: &GuildId, phase: Phase, err: &ProviderError) -> Self {
        Self::new(err.kind(), guild.clone(), phase, err.to_string())
    }

    pub fn from_transport(guild: &GuildId, phase: Phase, err: &TransportError) -> Self {
        let kind = match err {
            TransportError::Unavailable(_) => PipelineErrorKind::TransportUnavailable,
            TransportError::Disconnected => PipelineErrorKind::DisconnectedMidOperation,
        };
        Self::new(kind, guild.clone(), phase, err.to_string())
    }

    pub fn from_codec(guild: &GuildId, phase: Phase, err: &CodecError) -> Self {
        Self::new(
            PipelineErrorKind::MalformedAudio,
            guild.clone(),
            phase,
            err.to_string(),
        )
    }

    pub fn disconnected(guild: &GuildId, phase: Phase) -> Self {
        Self::new(
            PipelineErrorKind::DisconnectedMidOperation,
            guild.clone(),
            phase,
            "session stopped before the operation completed",
        )
    }
}

/// Typed failure returned by speech providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call timed out")]
    Timeout,

    #[error("provider rejected audio: {0}")]
    InvalidAudio(String),

    #[error("provider rejected request: {0}")]
    Rejected(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

impl ProviderError {
    pub fn kind(&self) -> PipelineErrorKind {
        match self {
            Self::RateLimited { .. } => PipelineErrorKind::ProviderRateLimited,
            Self::Unavailable(_) => PipelineErrorKind::ProviderUnavailable,
            Self::Timeout => PipelineErrorKind::ProviderTimeout,
            Self::InvalidAudio(_) => PipelineErrorKind::MalformedAudio,
            Self::Rejected(_) => PipelineErrorKind::ProviderRejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-requested minimum delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failure reported by the voice transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport disconnected")]
    Disconnected,
}

/// Failure reported by the agent backend. Timeouts are applied by the router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("agent rejected request: {0}")]
    Rejected(String),
}

/// Errors raised while parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

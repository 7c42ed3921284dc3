//! Real-time voice pipeline for guild voice channels.
//!
//! Each guild with an active session listens to its voice channel, gates
//! speech into utterances, transcribes them, routes the transcript to an
//! agent backend, synthesizes the reply and plays it back paced in real
//! time. Sessions are independent: one guild's slow provider or failure
//! never stalls another.
//!
//! External systems are reached through the traits in [`provider`]:
//! speech recognition and synthesis, the agent, the voice transport and a
//! text channel for notices. [`http`] provides an OpenAI-compatible adapter
//! for the two speech providers.
//!
//! [`SessionManager`] is the entry point.

pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod manager;
pub mod playback;
pub mod provider;
pub mod recognizer;
pub mod retry;
pub mod router;
pub mod session;
pub mod synthesizer;
pub mod telemetry;
mod worker;

pub use config::{
    LoggingConfig, PipelineConfig, PlaybackConfig, RecognitionConfig, RoutingConfig,
    SessionConfig, SynthesisConfig,
};
pub use error::{
    AgentError, ConfigError, Phase, PipelineError, PipelineErrorKind, ProviderError,
    TransportError,
};
pub use event::{SessionEvent, DEFAULT_EVENT_CAPACITY};
pub use http::{HttpProviderConfig, OpenAiSpeechClient};
pub use manager::{AudioSink, SessionManager};
pub use playback::{PlaybackScheduler, PlaybackStats};
pub use provider::{
    AgentBackend, LogNotifier, RecognitionProvider, SynthesisProvider, SynthesizedAudio,
    SynthesisRequest, TextNotifier, TranscriptionRequest, TranscriptionResult, VoiceTransport,
};
pub use recognizer::{Recognition, SpeechRecognizer, Utterance};
pub use retry::RetryPolicy;
pub use router::{CommandRouter, RouteOutcome};
pub use session::{
    ErrorOutcome, GuildVoiceSession, InvalidTransition, SessionSnapshot, SessionState, StopReason,
};
pub use synthesizer::{split_text, SpeechSynthesizer, SynthesisStream, SynthesizedChunk};
pub use telemetry::init_tracing;
pub use worker::Providers;

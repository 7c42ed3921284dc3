//! Seams to the external collaborators of the pipeline.
//!
//! Speech providers, the agent backend, the voice transport and the text
//! channel are all reached through these traits. The pipeline never assumes a
//! particular vendor; [`crate::http`] ships one OpenAI-compatible adapter.

use crate::error::{AgentError, ProviderError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parley_types::{ChannelId, EncodedFrame, GuildId};

/// Audio handed to the recognition provider.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    /// Audio in the provider's wire format (a 16 kHz mono WAV file).
    pub audio: Bytes,
    pub mime_type: &'static str,
    /// ISO 639-1 language hint. `None` lets the provider detect.
    pub language: Option<String>,
}

/// A recognition provider's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub text: String,
    /// Provider confidence in [0, 1].
    pub confidence: f32,
    pub language: Option<String>,
}

/// Text handed to the synthesis provider.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
}

/// PCM returned by a synthesis provider, in whatever format it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Interleaved signed 16-bit samples.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Speech-to-text backend. One call per utterance.
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, ProviderError>;
}

/// Text-to-speech backend. One call per text chunk.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn synthesize(&self, request: SynthesisRequest)
        -> Result<SynthesizedAudio, ProviderError>;
}

/// The reasoning agent: transcript in, reply text out.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn respond(&self, guild: &GuildId, text: &str) -> Result<String, AgentError>;
}

/// Outbound side of the voice gateway.
///
/// Inbound packets are pushed into the pipeline through
/// [`crate::SessionManager::deliver_audio`]; this trait covers joining,
/// leaving and sending.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, guild: &GuildId, channel: &ChannelId) -> Result<(), TransportError>;

    async fn disconnect(&self, guild: &GuildId);

    /// Sends one encoded frame. The transport encrypts and transmits it.
    async fn send_frame(&self, guild: &GuildId, frame: EncodedFrame)
        -> Result<(), TransportError>;
}

/// Text channel used for replies the pipeline cannot speak.
#[async_trait]
pub trait TextNotifier: Send + Sync {
    async fn post(&self, guild: &GuildId, channel: Option<&ChannelId>, text: &str);
}

/// A notifier that only logs. Used when no text surface is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl TextNotifier for LogNotifier {
    async fn post(&self, guild: &GuildId, channel: Option<&ChannelId>, text: &str) {
        tracing::info!(
            guild = %guild,
            channel = channel.map(ChannelId::as_str).unwrap_or("<none>"),
            text,
            "text notice"
        );
    }
}

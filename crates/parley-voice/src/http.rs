//! OpenAI-compatible HTTP speech providers.
//!
//! `/audio/transcriptions` takes a multipart WAV upload and
//! `/audio/speech` returns raw PCM (`response_format = "pcm"`, 24 kHz mono
//! s16le). HTTP failures are classified into [`ProviderError`] so the retry
//! policy can tell transient failures from terminal ones.

use crate::error::ProviderError;
use crate::provider::{
    RecognitionProvider, SynthesisProvider, SynthesisRequest, SynthesizedAudio,
    TranscriptionRequest, TranscriptionResult,
};
use async_trait::async_trait;
use parley_audio::pcm::pcm_from_le_bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sample rate of `response_format = "pcm"` speech output.
const SPEECH_PCM_SAMPLE_RATE: u32 = 24_000;

/// Longest error body kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 200;

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_speech_model() -> String {
    "tts-1".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Endpoint and credentials for the HTTP providers.
#[derive(Clone, Deserialize)]
pub struct HttpProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token. Empty means no `Authorization` header.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,

    #[serde(default = "default_speech_model")]
    pub speech_model: String,

    /// Client-side timeout per request. Default: 30000.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            transcription_model: default_transcription_model(),
            speech_model: default_speech_model(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl fmt::Debug for HttpProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("transcription_model", &self.transcription_model)
            .field("speech_model", &self.speech_model)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// Client for OpenAI-compatible speech endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiSpeechClient {
    http: reqwest::Client,
    config: HttpProviderConfig,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionSegment {
    avg_logprob: f64,
}

#[derive(Debug, Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    speed: f32,
}

impl OpenAiSpeechClient {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.config.api_key)
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), retry_after, &body))
    }
}

#[async_trait]
impl RecognitionProvider for OpenAiSpeechClient {
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, ProviderError> {
        let file = reqwest::multipart::Part::bytes(request.audio.to_vec())
            .file_name("utterance.wav")
            .mime_str(request.mime_type)
            .map_err(|e| ProviderError::InvalidAudio(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.config.transcription_model.clone())
            .text("response_format", "verbose_json");
        if let Some(language) = request.language {
            form = form.text("language", language);
        }

        let response = self
            .authorize(self.http.post(self.url("audio/transcriptions")))
            .multipart(form)
            .send()
            .await
            .map_err(classify_send_error)?;
        let response = Self::check(response).await?;
        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("invalid transcription body: {e}")))?;

        Ok(TranscriptionResult {
            confidence: segment_confidence(&body.segments),
            text: body.text.trim().to_string(),
            language: body.language,
        })
    }
}

#[async_trait]
impl SynthesisProvider for OpenAiSpeechClient {
    async fn synthesize(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesizedAudio, ProviderError> {
        let body = SpeechBody {
            model: &self.config.speech_model,
            input: &request.text,
            voice: &request.voice,
            response_format: "pcm",
            speed: request.speed,
        };
        let response = self
            .authorize(self.http.post(self.url("audio/speech")))
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;
        let response = Self::check(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("speech body interrupted: {e}")))?;

        Ok(SynthesizedAudio {
            samples: pcm_from_le_bytes(&bytes),
            sample_rate: SPEECH_PCM_SAMPLE_RATE,
            channels: 1,
        })
    }
}

/// Maps an HTTP error status onto the provider taxonomy.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let detail = format!("HTTP {status}: {}", truncate(body.trim()));
    match status {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::Rejected(detail),
        400 | 413 | 415 | 422 => ProviderError::InvalidAudio(detail),
        408 | 504 => ProviderError::Timeout,
        500..=599 => ProviderError::Unavailable(detail),
        _ => ProviderError::Rejected(detail),
    }
}

/// Parses a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    // Rejects negative, non-finite and out-of-range values.
    Duration::try_from_secs_f64(secs).ok()
}

fn classify_send_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

/// Average segment probability; providers that report no segments are
/// taken at face value.
fn segment_confidence(segments: &[TranscriptionSegment]) -> f32 {
    if segments.is_empty() {
        return 1.0;
    }
    let mean = segments.iter().map(|s| s.avg_logprob).sum::<f64>() / segments.len() as f64;
    mean.exp().clamp(0.0, 1.0) as f32
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

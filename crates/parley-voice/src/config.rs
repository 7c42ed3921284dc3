//! Pipeline configuration.
//!
//! Every section has serde defaults, so an empty document yields the stock
//! pipeline. All durations are plain millisecond fields with `Duration`
//! accessors; tests shrink them to keep simulated runs short.

use crate::error::ConfigError;
use crate::http::HttpProviderConfig;
use crate::retry::RetryPolicy;
use parley_audio::{CodecKind, GateConfig, JitterConfig};
use parley_types::{SpeechProfile, UserId, FRAME_DURATION_MS};
use serde::Deserialize;
use std::time::Duration;

/// Top-level pipeline configuration, shared read-only by every session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Wire codec negotiated with the transport.
    #[serde(default)]
    pub codec: CodecKind,

    #[serde(default)]
    pub jitter: JitterConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub recognition: RecognitionConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Retry policy for recognition and synthesis calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Connection details for the bundled HTTP providers.
    #[serde(default)]
    pub http: HttpProviderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Speech recognition settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Deadline for a single provider call. Default: 30000.
    #[serde(default = "default_call_deadline_ms")]
    pub deadline_ms: u64,

    /// Utterances with less voiced audio than this are dropped without a call.
    /// Default: 300.
    #[serde(default = "default_min_utterance_ms")]
    pub min_utterance_ms: u64,
}

/// Speech synthesis settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    /// Deadline for a single provider call. Default: 30000.
    #[serde(default = "default_call_deadline_ms")]
    pub deadline_ms: u64,

    /// Longest text sent in one synthesis call, in characters. Default: 500.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    /// Voice and language used by the pipeline.
    #[serde(default)]
    pub profile: SpeechProfile,
}

/// Agent routing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Deadline for the agent call. Default: 30000.
    #[serde(default = "default_call_deadline_ms")]
    pub deadline_ms: u64,

    /// Reply used when the agent misses its deadline.
    #[serde(default = "default_apology")]
    pub apology: String,

    /// Message posted to the text channel when a spoken request could not be
    /// transcribed.
    #[serde(default = "default_recognition_failed_notice")]
    pub recognition_failed_notice: String,

    /// Whether `ask_question` answers are also spoken in the voice channel.
    #[serde(default)]
    pub speak_text_answers: bool,
}

/// Outbound playback settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Bound on queued outbound audio. Default: 500.
    #[serde(default = "default_queue_ms")]
    pub queue_ms: u64,

    /// Silence frames sent after the queue drains. Default: 5.
    #[serde(default = "default_trailing_silence_frames")]
    pub trailing_silence_frames: u32,
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Consecutive errors tolerated before the session is forced off. Default: 5.
    #[serde(default = "default_error_ceiling")]
    pub error_ceiling: u32,

    /// Session stops after this long without audio or commands. Default: 300000.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Session stops after the channel has been empty this long. Default: 60000.
    #[serde(default = "default_empty_channel_timeout_ms")]
    pub empty_channel_timeout_ms: u64,

    /// Deadline for joining the voice channel. Default: 10000.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Inbound packets buffered between the transport and the session.
    /// Default: 256.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,

    /// The pipeline's own user id; its voice-state changes signal disconnects.
    #[serde(default)]
    pub self_user: Option<UserId>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_call_deadline_ms() -> u64 {
    30_000
}

fn default_min_utterance_ms() -> u64 {
    300
}

fn default_max_chunk_chars() -> usize {
    500
}

fn default_apology() -> String {
    "Sorry, that took too long. Please try again.".to_string()
}

fn default_recognition_failed_notice() -> String {
    "Sorry, I couldn't make out what was said.".to_string()
}

fn default_queue_ms() -> u64 {
    500
}

fn default_trailing_silence_frames() -> u32 {
    5
}

fn default_error_ceiling() -> u32 {
    5
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_empty_channel_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_inbound_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_call_deadline_ms(),
            min_utterance_ms: default_min_utterance_ms(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_call_deadline_ms(),
            max_chunk_chars: default_max_chunk_chars(),
            profile: SpeechProfile::default(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_call_deadline_ms(),
            apology: default_apology(),
            recognition_failed_notice: default_recognition_failed_notice(),
            speak_text_answers: false,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_ms: default_queue_ms(),
            trailing_silence_frames: default_trailing_silence_frames(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            error_ceiling: default_error_ceiling(),
            idle_timeout_ms: default_idle_timeout_ms(),
            empty_channel_timeout_ms: default_empty_channel_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            inbound_capacity: default_inbound_capacity(),
            self_user: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl RecognitionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn min_utterance(&self) -> Duration {
        Duration::from_millis(self.min_utterance_ms)
    }
}

impl SynthesisConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl RoutingConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl PlaybackConfig {
    /// Queue bound in frames (at least one).
    pub fn queue_frames(&self) -> usize {
        ((self.queue_ms / FRAME_DURATION_MS) as usize).max(1)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn empty_channel_timeout(&self) -> Duration {
        Duration::from_millis(self.empty_channel_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl PipelineConfig {
    /// Parses a TOML document and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and
    /// `ConfigError::Invalid` for values the pipeline cannot run with.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment variable overrides.
    ///
    /// - `PARLEY_LOG_LEVEL` overrides `logging.level`
    /// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
    /// - `PARLEY_API_KEY` overrides `http.api_key`
    /// - `PARLEY_API_BASE_URL` overrides `http.base_url`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PARLEY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = std::env::var("PARLEY_LOG_JSON") {
            self.logging.json = json == "true" || json == "1";
        }
        if let Ok(key) = std::env::var("PARLEY_API_KEY") {
            self.http.api_key = key;
        }
        if let Ok(url) = std::env::var("PARLEY_API_BASE_URL") {
            self.http.base_url = url;
        }
    }

    /// Rejects settings that would stall or disable the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jitter.window_ms < FRAME_DURATION_MS {
            return Err(invalid("jitter.window_ms", "must cover at least one frame"));
        }
        if self.gate.hangover_ms < FRAME_DURATION_MS {
            return Err(invalid("gate.hangover_ms", "must cover at least one frame"));
        }
        if self.gate.max_utterance_ms < self.recognition.min_utterance_ms {
            return Err(invalid(
                "gate.max_utterance_ms",
                "must not be shorter than recognition.min_utterance_ms",
            ));
        }
        if !(0.0..=100.0).contains(&self.gate.threshold) {
            return Err(invalid("gate.threshold", "must be within 0-100"));
        }
        if self.synthesis.max_chunk_chars == 0 {
            return Err(invalid("synthesis.max_chunk_chars", "must be positive"));
        }
        if self.playback.queue_ms < FRAME_DURATION_MS {
            return Err(invalid("playback.queue_ms", "must cover at least one frame"));
        }
        if self.session.error_ceiling == 0 {
            return Err(invalid("session.error_ceiling", "must be positive"));
        }
        if self.session.inbound_capacity == 0 {
            return Err(invalid("session.inbound_capacity", "must be positive"));
        }
        for (field, value) in [
            ("recognition.deadline_ms", self.recognition.deadline_ms),
            ("synthesis.deadline_ms", self.synthesis.deadline_ms),
            ("routing.deadline_ms", self.routing.deadline_ms),
            ("session.connect_timeout_ms", self.session.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be at least 1.0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_file_values() {
        // The only test touching PARLEY_* variables.
        std::env::set_var("PARLEY_LOG_LEVEL", "parley_voice=debug");
        std::env::set_var("PARLEY_LOG_JSON", "1");
        std::env::set_var("PARLEY_API_KEY", "sk-from-env");
        std::env::set_var("PARLEY_API_BASE_URL", "http://localhost:9000/v1");

        let mut config = PipelineConfig::from_toml_str("[logging]\nlevel = \"warn\"\n").unwrap();
        config.apply_env_overrides();

        for var in [
            "PARLEY_LOG_LEVEL",
            "PARLEY_LOG_JSON",
            "PARLEY_API_KEY",
            "PARLEY_API_BASE_URL",
        ] {
            std::env::remove_var(var);
        }
        assert_eq!(config.logging.level, "parley_voice=debug");
        assert!(config.logging.json);
        assert_eq!(config.http.api_key, "sk-from-env");
        assert_eq!(config.http.base_url, "http://localhost:9000/v1");
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.codec, CodecKind::Pcm16);
        assert_eq!(config.jitter.window_ms, 200);
        assert_eq!(config.gate.hangover_ms, 800);
        assert_eq!(config.recognition.deadline(), Duration::from_secs(30));
        assert_eq!(config.recognition.min_utterance(), Duration::from_millis(300));
        assert_eq!(config.synthesis.max_chunk_chars, 500);
        assert_eq!(config.playback.queue_frames(), 25);
        assert_eq!(config.playback.trailing_silence_frames, 5);
        assert_eq!(config.session.error_ceiling, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn sections_override_individual_fields() {
        let config = PipelineConfig::from_toml_str(
            r#"
            codec = "pcm16"

            [gate]
            hangover_ms = 400

            [synthesis.profile]
            voice = "nova"

            [session]
            error_ceiling = 2
            self_user = "bot"

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.gate.hangover_ms, 400);
        assert_eq!(config.gate.max_utterance_ms, 30_000);
        assert_eq!(config.synthesis.profile.voice, "nova");
        assert_eq!(config.synthesis.profile.language.as_deref(), Some("en"));
        assert_eq!(config.session.error_ceiling, 2);
        assert_eq!(config.session.self_user, Some(UserId::from("bot")));
        assert!(config.logging.json);
    }

    #[test]
    fn zero_error_ceiling_is_rejected() {
        let err = PipelineConfig::from_toml_str("[session]\nerror_ceiling = 0").unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "session.error_ceiling"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn sub_frame_hangover_is_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml_str("[gate]\nhangover_ms = 5"),
            Err(ConfigError::Invalid {
                field: "gate.hangover_ms",
                ..
            })
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            PipelineConfig::from_toml_str("[gate\nthreshold = "),
            Err(ConfigError::Parse(_))
        ));
    }
}

//! Speech profile definitions.
//!
//! A `SpeechProfile` selects the synthesis voice and the language hint passed
//! to recognition for one guild's pipeline.

use serde::{Deserialize, Serialize};

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_language() -> Option<String> {
    Some("en".to_string())
}

fn default_speed() -> f32 {
    1.0
}

/// Voice and language settings for a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechProfile {
    /// Provider voice identifier used for synthesis.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Language hint for recognition (ISO 639-1). `None` lets the provider detect.
    #[serde(default = "default_language")]
    pub language: Option<String>,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default = "default_speed")]
    pub speed: f32,
}

impl Default for SpeechProfile {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            language: default_language(),
            speed: default_speed(),
        }
    }
}

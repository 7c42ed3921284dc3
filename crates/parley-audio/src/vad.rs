//! Voice activity gate.
//!
//! Classifies each PCM frame as speech or silence from its short-term energy
//! and tracks utterance boundaries. Speech starts on the first frame at or
//! above the threshold; it ends once silence has persisted for the hangover
//! duration, so natural pauses do not split one utterance into several.
//!
//! Durations are counted in frames, never read from a clock, which keeps the
//! gate deterministic under simulation.

use parley_types::{PcmFrame, FRAME_DURATION};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Energy floor in dBFS that maps to level 0.
const ENERGY_FLOOR_DBFS: f32 = -60.0;

fn default_threshold() -> f32 {
    30.0
}

fn default_hangover_ms() -> u64 {
    800
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

fn default_confidence_span() -> f32 {
    25.0
}

/// Gate tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Speech threshold on the 0-100 energy scale. Default: 30 (about -42 dBFS).
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Silence needed to end an utterance, in milliseconds. Default: 800.
    #[serde(default = "default_hangover_ms")]
    pub hangover_ms: u64,

    /// Utterances are cut at this length, in milliseconds. Default: 30000.
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,

    /// Energy margin above threshold that maps to confidence 1.0. Default: 25.
    #[serde(default = "default_confidence_span")]
    pub confidence_span: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            hangover_ms: default_hangover_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            confidence_span: default_confidence_span(),
        }
    }
}

impl GateConfig {
    pub fn hangover(&self) -> Duration {
        Duration::from_millis(self.hangover_ms)
    }

    pub fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }
}

/// Per-frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Speech,
    Silence,
}

/// Utterance boundary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    UtteranceStarted,
    UtteranceEnded {
        /// Span from the first to the last speech frame.
        voiced: Duration,
        /// True when the maximum utterance length cut the utterance.
        forced: bool,
    },
}

/// Result of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub activity: Activity,
    /// Normalised energy, 0-100.
    pub energy: f32,
    /// Diagnostic confidence in [0, 1]; not used for gating.
    pub confidence: f32,
    pub event: Option<GateEvent>,
}

/// Speech/silence classifier with utterance tracking.
#[derive(Debug, Clone)]
pub struct VoiceActivityGate {
    config: GateConfig,
    in_utterance: bool,
    utterance_len: Duration,
    silence_run: Duration,
}

impl VoiceActivityGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            in_utterance: false,
            utterance_len: Duration::ZERO,
            silence_run: Duration::ZERO,
        }
    }

    pub fn classify(&mut self, frame: &PcmFrame) -> Classification {
        let energy = frame_energy(frame.samples());
        let activity = if energy >= self.config.threshold {
            Activity::Speech
        } else {
            Activity::Silence
        };
        let confidence = self.confidence(energy);

        let event = if self.in_utterance {
            self.continue_utterance(activity)
        } else if activity == Activity::Speech {
            self.in_utterance = true;
            self.utterance_len = FRAME_DURATION;
            self.silence_run = Duration::ZERO;
            debug!(energy, sequence = frame.sequence(), "utterance started");
            Some(GateEvent::UtteranceStarted)
        } else {
            None
        };

        Classification {
            activity,
            energy,
            confidence,
            event,
        }
    }

    /// Whether the gate is currently inside an utterance.
    pub fn in_utterance(&self) -> bool {
        self.in_utterance
    }

    /// Abandons any utterance in progress.
    pub fn reset(&mut self) {
        self.in_utterance = false;
        self.utterance_len = Duration::ZERO;
        self.silence_run = Duration::ZERO;
    }

    fn continue_utterance(&mut self, activity: Activity) -> Option<GateEvent> {
        self.utterance_len += FRAME_DURATION;
        match activity {
            Activity::Speech => self.silence_run = Duration::ZERO,
            Activity::Silence => self.silence_run += FRAME_DURATION,
        }

        let voiced = self.utterance_len.saturating_sub(self.silence_run);
        if self.silence_run >= self.config.hangover() {
            debug!(voiced_ms = voiced.as_millis() as u64, "utterance ended");
            self.reset();
            return Some(GateEvent::UtteranceEnded {
                voiced,
                forced: false,
            });
        }
        if self.utterance_len >= self.config.max_utterance() {
            debug!(voiced_ms = voiced.as_millis() as u64, "utterance cut at maximum length");
            self.reset();
            return Some(GateEvent::UtteranceEnded {
                voiced,
                forced: true,
            });
        }
        None
    }

    fn confidence(&self, energy: f32) -> f32 {
        if self.config.confidence_span <= 0.0 {
            return if energy >= self.config.threshold { 1.0 } else { 0.0 };
        }
        ((energy - self.config.threshold) / self.config.confidence_span).clamp(0.0, 1.0)
    }
}

/// Normalised short-term energy of a frame on a 0-100 scale.
///
/// The RMS level is converted to dBFS and mapped linearly so that -60 dBFS
/// and below is 0 and full scale is 100.
pub fn frame_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
    let rms = (sum / samples.len() as f64).sqrt();
    if rms < 1.0 {
        return 0.0;
    }
    let dbfs = 20.0 * (rms / f64::from(i16::MAX)).log10() as f32;
    ((dbfs - ENERGY_FLOOR_DBFS) / -ENERGY_FLOOR_DBFS * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::SAMPLES_PER_FRAME;

    fn tone(sequence: u16, amplitude: i16) -> PcmFrame {
        let samples = (0..SAMPLES_PER_FRAME)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        PcmFrame::new(sequence, 0, samples).unwrap()
    }

    fn gate(hangover_ms: u64) -> VoiceActivityGate {
        VoiceActivityGate::new(GateConfig {
            hangover_ms,
            ..GateConfig::default()
        })
    }

    #[test]
    fn energy_scale_endpoints() {
        assert_eq!(frame_energy(&[0; 16]), 0.0);
        let full = frame_energy(&[i16::MAX; 16]);
        assert!((full - 100.0).abs() < 0.01, "{full}");
        // -20 dBFS sits at two thirds of the scale.
        let quiet = frame_energy(&[3277; 16]);
        assert!((quiet - 66.7).abs() < 0.5, "{quiet}");
    }

    #[test]
    fn speech_start_fires_once() {
        let mut gate = gate(800);
        let first = gate.classify(&tone(0, 8000));
        assert_eq!(first.event, Some(GateEvent::UtteranceStarted));
        let second = gate.classify(&tone(1, 8000));
        assert_eq!(second.event, None);
        assert_eq!(second.activity, Activity::Speech);
    }

    #[test]
    fn silence_for_full_hangover_ends_utterance_exactly_once() {
        let mut gate = gate(800);
        for seq in 0..10 {
            gate.classify(&tone(seq, 8000));
        }
        let mut ended = Vec::new();
        // 800 ms of silence is 40 frames; feed more to prove no second event.
        for seq in 10..80 {
            if let Some(event) = gate.classify(&PcmFrame::silence(seq, 0)).event {
                ended.push((seq, event));
            }
        }
        assert_eq!(ended.len(), 1);
        let (seq, event) = ended[0];
        assert_eq!(seq, 49);
        assert_eq!(
            event,
            GateEvent::UtteranceEnded {
                voiced: Duration::from_millis(200),
                forced: false
            }
        );
    }

    #[test]
    fn pause_shorter_than_hangover_does_not_split() {
        let mut gate = gate(800);
        let mut events = Vec::new();
        let frames = (0..5)
            .map(|s| tone(s, 8000))
            .chain((5..30).map(|s| PcmFrame::silence(s, 0)))
            .chain((30..35).map(|s| tone(s, 8000)));
        for frame in frames {
            if let Some(event) = gate.classify(&frame).event {
                events.push(event);
            }
        }
        assert_eq!(events, vec![GateEvent::UtteranceStarted]);
        assert!(gate.in_utterance());
    }

    #[test]
    fn max_length_forces_end() {
        let mut gate = VoiceActivityGate::new(GateConfig {
            max_utterance_ms: 100,
            ..GateConfig::default()
        });
        let events: Vec<_> = (0..5)
            .filter_map(|s| gate.classify(&tone(s, 8000)).event)
            .collect();
        assert_eq!(
            events,
            vec![
                GateEvent::UtteranceStarted,
                GateEvent::UtteranceEnded {
                    voiced: Duration::from_millis(100),
                    forced: true
                }
            ]
        );
    }

    #[test]
    fn confidence_is_monotonic_and_clamped() {
        let mut gate = gate(800);
        let quiet = gate.classify(&tone(0, 40)).confidence;
        let mid = gate.classify(&tone(1, 1000)).confidence;
        let loud = gate.classify(&tone(2, 30000)).confidence;
        assert_eq!(quiet, 0.0);
        assert!(mid > quiet && mid < loud, "{quiet} {mid} {loud}");
        assert!(loud <= 1.0);
    }
}

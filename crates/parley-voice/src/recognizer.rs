//! Utterance buffering and speech recognition.
//!
//! The recognizer owns the utterance being spoken. Frames are appended on the
//! audio tick; when the gate reports the end of speech, [`SpeechRecognizer::flush`]
//! detaches the utterance and returns a self-contained future performing the
//! provider call, so the caller can run it off the tick.

use crate::config::RecognitionConfig;
use crate::error::{PipelineError, Phase};
use crate::provider::{RecognitionProvider, TranscriptionRequest, TranscriptionResult};
use crate::retry::RetryPolicy;
use bytes::Bytes;
use parley_audio::pcm::{encode_wav, transport_to_recognition, RECOGNITION_SAMPLE_RATE};
use parley_audio::Activity;
use parley_types::{GuildId, PcmFrame, FRAME_DURATION};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decoded frames of one utterance, in strictly increasing sequence order.
#[derive(Debug, Clone, Default)]
pub struct Utterance {
    frames: Vec<PcmFrame>,
    /// Frames up to and including the last voiced one.
    voiced_len: usize,
}

impl Utterance {
    /// Appends a frame. Returns `false` (and keeps the utterance unchanged)
    /// if the frame does not advance the sequence.
    pub fn push(&mut self, frame: PcmFrame, activity: Activity) -> bool {
        if let Some(last) = self.frames.last() {
            let advance = frame.sequence().wrapping_sub(last.sequence()) as i16;
            if advance <= 0 {
                return false;
            }
        }
        self.frames.push(frame);
        if activity == Activity::Speech {
            self.voiced_len = self.frames.len();
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Duration including trailing silence.
    pub fn duration(&self) -> Duration {
        FRAME_DURATION * self.frames.len() as u32
    }

    /// Duration up to the last voiced frame.
    pub fn voiced_duration(&self) -> Duration {
        FRAME_DURATION * self.voiced_len as u32
    }

    pub fn frames(&self) -> &[PcmFrame] {
        &self.frames
    }

    /// Drops the silence after the last voiced frame.
    pub fn trim_trailing_silence(&mut self) {
        self.frames.truncate(self.voiced_len);
    }

    /// Encodes the utterance as a 16 kHz mono WAV file.
    pub fn to_wav(&self) -> Vec<u8> {
        let mut mono = Vec::with_capacity(self.frames.len() * 320);
        for frame in &self.frames {
            mono.extend(transport_to_recognition(frame.samples()));
        }
        encode_wav(&mono, RECOGNITION_SAMPLE_RATE, 1)
    }
}

/// Outcome of flushing one utterance.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Transcribed {
        result: TranscriptionResult,
        retries: u32,
    },
    /// Too short to be speech; no provider call was made.
    Discarded { voiced: Duration },
}

/// Buffers utterances and transcribes them with retry.
pub struct SpeechRecognizer {
    guild: GuildId,
    provider: Arc<dyn RecognitionProvider>,
    config: RecognitionConfig,
    retry: RetryPolicy,
    language: Option<String>,
    current: Utterance,
}

impl std::fmt::Debug for SpeechRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechRecognizer")
            .field("guild", &self.guild)
            .field("buffered_frames", &self.current.len())
            .finish_non_exhaustive()
    }
}

impl SpeechRecognizer {
    pub fn new(
        guild: GuildId,
        provider: Arc<dyn RecognitionProvider>,
        config: RecognitionConfig,
        retry: RetryPolicy,
        language: Option<String>,
    ) -> Self {
        Self {
            guild,
            provider,
            config,
            retry,
            language,
            current: Utterance::default(),
        }
    }

    /// Appends a frame to the current utterance.
    pub fn accumulate(&mut self, frame: PcmFrame, activity: Activity) {
        let sequence = frame.sequence();
        if !self.current.push(frame, activity) {
            warn!(guild = %self.guild, sequence, "out-of-order frame dropped from utterance");
        }
    }

    /// Detaches the current utterance, leaving an empty one in its place.
    pub fn take_utterance(&mut self) -> Utterance {
        std::mem::take(&mut self.current)
    }

    /// Abandons the current utterance.
    pub fn discard(&mut self) {
        self.current = Utterance::default();
    }

    pub fn buffered(&self) -> &Utterance {
        &self.current
    }

    /// Detaches the current utterance and returns the recognition call for it.
    pub fn flush(
        &mut self,
    ) -> impl Future<Output = Result<Recognition, PipelineError>> + Send + 'static {
        let utterance = self.take_utterance();
        self.transcribe(utterance)
    }

    /// Builds the recognition call for an already detached utterance.
    ///
    /// The returned future owns everything it needs, so it can be spawned.
    pub fn transcribe(
        &self,
        mut utterance: Utterance,
    ) -> impl Future<Output = Result<Recognition, PipelineError>> + Send + 'static {
        let guild = self.guild.clone();
        let provider = Arc::clone(&self.provider);
        let retry = self.retry.clone();
        let deadline = self.config.deadline();
        let min_utterance = self.config.min_utterance();
        let language = self.language.clone();

        async move {
            utterance.trim_trailing_silence();
            let voiced = utterance.voiced_duration();
            if voiced < min_utterance {
                debug!(
                    guild = %guild,
                    voiced_ms = voiced.as_millis() as u64,
                    "utterance below minimum length discarded"
                );
                return Ok(Recognition::Discarded { voiced });
            }

            let audio = Bytes::from(utterance.to_wav());
            info!(
                guild = %guild,
                voiced_ms = voiced.as_millis() as u64,
                bytes = audio.len(),
                "transcribing utterance"
            );

            let outcome = retry
                .run("transcribe", deadline, |_| {
                    let request = TranscriptionRequest {
                        audio: audio.clone(),
                        mime_type: "audio/wav",
                        language: language.clone(),
                    };
                    let provider = Arc::clone(&provider);
                    async move { provider.transcribe(request).await }
                })
                .await;

            match outcome {
                Ok(done) => Ok(Recognition::Transcribed {
                    result: done.value,
                    retries: done.retries,
                }),
                Err(failure) => Err(PipelineError::from_provider(
                    &guild,
                    Phase::Recognition,
                    &failure.error,
                )),
            }
        }
    }
}

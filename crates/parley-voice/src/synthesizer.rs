//! Text chunking and speech synthesis.
//!
//! Long replies are split into chunks no longer than the provider limit,
//! preferring sentence boundaries. Chunks are synthesized one at a time, in
//! order, and streamed to the caller as each completes so playback can start
//! before the whole reply is rendered.

use crate::config::SynthesisConfig;
use crate::error::{PipelineError, Phase};
use crate::provider::{SynthesisProvider, SynthesisRequest};
use crate::retry::RetryPolicy;
use parley_audio::pcm;
use parley_types::{GuildId, SpeechProfile};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One synthesized chunk, already in transport PCM (48 kHz stereo).
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedChunk {
    pub index: usize,
    pub text: String,
    pub samples: Vec<i16>,
    /// Retries spent on this chunk.
    pub retries: u32,
}

/// In-order stream of synthesized chunks.
///
/// Ends after the last chunk, after the first error, or on cancellation.
#[derive(Debug)]
pub struct SynthesisStream {
    rx: mpsc::Receiver<Result<SynthesizedChunk, PipelineError>>,
    total: usize,
}

impl SynthesisStream {
    pub async fn next(&mut self) -> Option<Result<SynthesizedChunk, PipelineError>> {
        self.rx.recv().await
    }

    /// Number of chunks the text was split into.
    pub fn total_chunks(&self) -> usize {
        self.total
    }
}

/// Synthesizes agent replies chunk by chunk with retry.
#[derive(Clone)]
pub struct SpeechSynthesizer {
    guild: GuildId,
    provider: Arc<dyn SynthesisProvider>,
    config: SynthesisConfig,
    retry: RetryPolicy,
}

impl std::fmt::Debug for SpeechSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechSynthesizer")
            .field("guild", &self.guild)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SpeechSynthesizer {
    pub fn new(
        guild: GuildId,
        provider: Arc<dyn SynthesisProvider>,
        config: SynthesisConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            guild,
            provider,
            config,
            retry,
        }
    }

    pub fn profile(&self) -> &SpeechProfile {
        &self.config.profile
    }

    /// Starts synthesizing `text` on a background task.
    ///
    /// Only one chunk is in flight at a time. Cancelling `cancel` stops the
    /// task and drops any call in progress.
    pub fn synthesize(&self, text: &str, cancel: CancellationToken) -> SynthesisStream {
        let chunks = split_text(text, self.config.max_chunk_chars);
        let total = chunks.len();
        let (tx, rx) = mpsc::channel(1);
        let this = self.clone();

        tokio::spawn(async move {
            for (index, chunk) in chunks.into_iter().enumerate() {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(guild = %this.guild, index, "synthesis cancelled");
                        return;
                    }
                    result = this.synthesize_chunk(index, chunk) => result,
                };
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    return;
                }
            }
        });

        SynthesisStream { rx, total }
    }

    /// Synthesizes a single chunk with retry.
    pub async fn synthesize_chunk(
        &self,
        index: usize,
        text: String,
    ) -> Result<SynthesizedChunk, PipelineError> {
        let profile = &self.config.profile;
        let outcome = self
            .retry
            .run("synthesize", self.config.deadline(), |_| {
                let request = SynthesisRequest {
                    text: text.clone(),
                    voice: profile.voice.clone(),
                    speed: profile.speed,
                };
                let provider = Arc::clone(&self.provider);
                async move { provider.synthesize(request).await }
            })
            .await
            .map_err(|failure| {
                PipelineError::from_provider(&self.guild, Phase::Synthesis, &failure.error)
            })?;

        let audio = outcome.value;
        let samples = pcm::to_transport(&audio.samples, audio.sample_rate, audio.channels);
        info!(
            guild = %self.guild,
            index,
            chars = text.chars().count(),
            retries = outcome.retries,
            duration_ms = pcm::duration_of(samples.len(), parley_types::SAMPLE_RATE, 2).as_millis() as u64,
            "chunk synthesized"
        );
        Ok(SynthesizedChunk {
            index,
            text,
            samples,
            retries: outcome.retries,
        })
    }
}

/// Splits `text` into chunks of at most `max_chars` characters.
///
/// Sentences are kept whole where possible; an overlong sentence is split at
/// whitespace, and an overlong word at a character boundary.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in sentences(text) {
        for piece in fit(sentence, max) {
            let current_len = current.chars().count();
            let separator = usize::from(!current.is_empty());
            if !current.is_empty() && current_len + separator + piece.chars().count() > max {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let at_break = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_break {
                let end = idx + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn fit(sentence: &str, max: usize) -> Vec<String> {
    if sentence.chars().count() <= max {
        return vec![sentence.to_string()];
    }
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            pieces.extend(chars.chunks(max).map(|c| c.iter().collect::<String>()));
            continue;
        }
        if current_len > 0 && current_len + 1 + word_len > max {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_text("  Hello there.  ", 500), vec!["Hello there."]);
        assert!(split_text("   ", 500).is_empty());
    }

    #[test]
    fn long_text_breaks_at_sentences() {
        let sentence = "This sentence is exactly fifty characters long ok.";
        assert_eq!(sentence.len(), 50);
        let text = vec![sentence; 25].join(" ");
        let chunks = split_text(&text, 500);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 500);
            assert!(chunk.ends_with("ok."));
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn decimal_points_do_not_end_sentences() {
        assert_eq!(sentences("Pi is 3.14 today. Yes!"), vec!["Pi is 3.14 today.", "Yes!"]);
    }

    #[test]
    fn overlong_sentence_splits_at_whitespace() {
        let text = "alpha beta gamma delta epsilon";
        let chunks = split_text(text, 12);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta", "epsilon"]);
    }

    #[test]
    fn overlong_word_splits_on_char_boundary() {
        let chunks = split_text("ééééé", 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }
}

mod common;

use common::{ScriptedRecognizer, ScriptedSynthesizer};
use parley_audio::pcm::{decode_wav, RECOGNITION_SAMPLE_RATE};
use parley_audio::Activity;
use parley_types::{GuildId, PcmFrame, SAMPLES_PER_FRAME};
use parley_voice::{
    PipelineErrorKind, ProviderError, Recognition, RecognitionConfig, RetryPolicy,
    SpeechRecognizer, SpeechSynthesizer, SynthesisConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
        multiplier: 2.0,
    }
}

fn recognizer(provider: &Arc<ScriptedRecognizer>) -> SpeechRecognizer {
    SpeechRecognizer::new(
        GuildId::from("guild1"),
        provider.clone(),
        RecognitionConfig {
            deadline_ms: 1_000,
            min_utterance_ms: 300,
        },
        policy(),
        Some("en".to_string()),
    )
}

fn synthesizer(provider: &Arc<ScriptedSynthesizer>, deadline_ms: u64) -> SpeechSynthesizer {
    SpeechSynthesizer::new(
        GuildId::from("guild1"),
        provider.clone(),
        SynthesisConfig {
            deadline_ms,
            max_chunk_chars: 60,
            ..SynthesisConfig::default()
        },
        policy(),
    )
}

fn speak(recognizer: &mut SpeechRecognizer, frames: u16) {
    for seq in 0..frames {
        let frame = PcmFrame::new(seq, u32::from(seq) * 960, vec![8000; SAMPLES_PER_FRAME]).unwrap();
        recognizer.accumulate(frame, Activity::Speech);
    }
}

#[tokio::test(start_paused = true)]
async fn utterance_is_sent_as_16k_mono_wav() {
    let provider = Arc::new(ScriptedRecognizer::answering("hello"));
    let mut recognizer = recognizer(&provider);
    speak(&mut recognizer, 25);

    let outcome = recognizer.flush().await.unwrap();
    assert_eq!(
        outcome,
        Recognition::Transcribed {
            result: common::transcript("hello"),
            retries: 0,
        }
    );
    assert!(recognizer.buffered().is_empty());

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].mime_type, "audio/wav");
    assert_eq!(requests[0].language.as_deref(), Some("en"));
    let (samples, rate, channels) = decode_wav(&requests[0].audio).unwrap();
    assert_eq!((rate, channels), (RECOGNITION_SAMPLE_RATE, 1));
    assert_eq!(samples.len(), 25 * 320);
}

#[tokio::test(start_paused = true)]
async fn short_utterance_never_reaches_the_provider() {
    let provider = Arc::new(ScriptedRecognizer::answering("hello"));
    let mut recognizer = recognizer(&provider);
    speak(&mut recognizer, 10); // 200 ms, below the 300 ms minimum

    let outcome = recognizer.flush().await.unwrap();
    assert_eq!(
        outcome,
        Recognition::Discarded {
            voiced: Duration::from_millis(200)
        }
    );
    assert_eq!(provider.calls.total(), 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_rate_limit_gives_up_after_retry_bound() {
    let provider = Arc::new(ScriptedRecognizer::failing(ProviderError::RateLimited {
        retry_after: None,
    }));
    let mut recognizer = recognizer(&provider);
    speak(&mut recognizer, 25);

    let started = Instant::now();
    let err = recognizer.flush().await.unwrap_err();
    assert_eq!(err.kind, PipelineErrorKind::ProviderRateLimited);
    assert_eq!(provider.calls.total(), 4);
    // 100 + 200 + 400 ms of backoff.
    assert_eq!(started.elapsed(), Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn day_long_retry_after_is_capped_by_the_policy() {
    let provider = Arc::new(ScriptedRecognizer::failing(ProviderError::RateLimited {
        retry_after: Some(Duration::from_secs(86_400)),
    }));
    let mut recognizer = recognizer(&provider);
    speak(&mut recognizer, 25);

    let started = Instant::now();
    let err = recognizer.flush().await.unwrap_err();
    assert_eq!(err.kind, PipelineErrorKind::ProviderRateLimited);
    assert_eq!(provider.calls.total(), 4);
    // Every retry waits the 1 s cap instead of a day.
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn rejected_audio_is_not_retried() {
    let provider = Arc::new(ScriptedRecognizer::failing(ProviderError::InvalidAudio(
        "unsupported format".into(),
    )));
    let mut recognizer = recognizer(&provider);
    speak(&mut recognizer, 25);

    let err = recognizer.flush().await.unwrap_err();
    assert_eq!(err.kind, PipelineErrorKind::MalformedAudio);
    assert_eq!(provider.calls.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn two_timeouts_then_success_reports_two_retries() {
    let provider = Arc::new(
        ScriptedSynthesizer::new(5)
            .then(Err(ProviderError::Timeout))
            .then(Err(ProviderError::Timeout)),
    );
    let synthesizer = synthesizer(&provider, 1_000);

    let chunk = synthesizer
        .synthesize_chunk(0, "Hello there.".to_string())
        .await
        .unwrap();
    assert_eq!(chunk.retries, 2);
    assert_eq!(provider.calls.total(), 3);
    // 5 frames of 24 kHz mono become 5 frames of 48 kHz stereo.
    assert_eq!(chunk.samples.len(), 5 * SAMPLES_PER_FRAME);
}

#[tokio::test(start_paused = true)]
async fn slow_provider_hits_the_per_call_deadline() {
    let provider = Arc::new(ScriptedSynthesizer::new(5).with_delay(Duration::from_secs(5)));
    let synthesizer = synthesizer(&provider, 200);

    let err = synthesizer
        .synthesize_chunk(0, "Hello.".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.kind, PipelineErrorKind::ProviderTimeout);
    assert_eq!(provider.calls.total(), 4);
}

#[tokio::test(start_paused = true)]
async fn long_reply_streams_chunks_in_order_one_call_at_a_time() {
    let provider = Arc::new(ScriptedSynthesizer::new(2).with_delay(Duration::from_millis(50)));
    let synthesizer = synthesizer(&provider, 1_000);
    let text = "The first sentence is right here now. The second sentence follows right after. \
                And a third one closes out the reply.";

    let mut stream = synthesizer.synthesize(text, CancellationToken::new());
    assert_eq!(stream.total_chunks(), 3);
    let mut indices = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        assert!(chunk.text.chars().count() <= 60);
        indices.push(chunk.index);
    }
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(provider.calls.max(), 1);

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests[0].text, "The first sentence is right here now.");
    assert_eq!(requests[0].voice, "alloy");
}

#[tokio::test(start_paused = true)]
async fn cancelled_synthesis_ends_the_stream() {
    let provider = Arc::new(ScriptedSynthesizer::new(2).with_delay(Duration::from_millis(500)));
    let synthesizer = synthesizer(&provider, 1_000);
    let cancel = CancellationToken::new();

    let mut stream = synthesizer.synthesize("One. Two. Three.", cancel.clone());
    cancel.cancel();
    assert!(stream.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn first_chunk_failure_ends_the_stream() {
    let provider =
        Arc::new(ScriptedSynthesizer::new(2).then(Err(ProviderError::Rejected("401".into()))));
    let synthesizer = synthesizer(&provider, 1_000);

    let mut stream = synthesizer.synthesize("One. Two.", CancellationToken::new());
    let first = stream.next().await.unwrap().unwrap_err();
    assert_eq!(first.kind, PipelineErrorKind::ProviderRejected);
    assert!(stream.next().await.is_none());
    assert_eq!(provider.calls.total(), 1);
}

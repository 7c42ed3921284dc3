#![allow(dead_code)]

use async_trait::async_trait;
use parley_types::{
    ChannelId, EncodedFrame, GuildId, InboundPacket, FRAME_DURATION, SAMPLES_PER_CHANNEL,
    SAMPLES_PER_FRAME,
};
use parley_voice::{
    AgentBackend, AgentError, PipelineConfig, ProviderError, Providers, RecognitionProvider,
    SessionEvent, SessionManager, SynthesisProvider, SynthesisRequest, SynthesizedAudio,
    TextNotifier, TranscriptionRequest, TranscriptionResult, TransportError, VoiceTransport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

// --- transport ---

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub guild: GuildId,
    pub frame: EncodedFrame,
    pub at: Instant,
}

#[derive(Default)]
pub struct RecordingTransport {
    pub frames: Mutex<Vec<SentFrame>>,
    pub connects: Mutex<Vec<(GuildId, ChannelId)>>,
    pub disconnects: Mutex<Vec<GuildId>>,
    pub connect_error: Mutex<Option<TransportError>>,
    pub send_error: Mutex<Option<TransportError>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<SentFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.lock().unwrap().len()
    }
}

#[async_trait]
impl VoiceTransport for RecordingTransport {
    async fn connect(&self, guild: &GuildId, channel: &ChannelId) -> Result<(), TransportError> {
        self.connects
            .lock()
            .unwrap()
            .push((guild.clone(), channel.clone()));
        match self.connect_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, guild: &GuildId) {
        self.disconnects.lock().unwrap().push(guild.clone());
    }

    async fn send_frame(&self, guild: &GuildId, frame: EncodedFrame) -> Result<(), TransportError> {
        if let Some(err) = self.send_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.frames.lock().unwrap().push(SentFrame {
            guild: guild.clone(),
            frame,
            at: Instant::now(),
        });
        Ok(())
    }
}

// --- providers ---

/// Tracks how many calls are running at once.
#[derive(Default)]
pub struct Concurrency {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) -> ConcurrencyGuard<'_> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ConcurrencyGuard(self)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

struct ConcurrencyGuard<'a>(&'a Concurrency);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Recognition provider that plays back a script, then a default answer.
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Result<TranscriptionResult, ProviderError>>>,
    default: Result<TranscriptionResult, ProviderError>,
    pub delay: Duration,
    /// Panic inside the call, like a provider with a bug.
    pub panics: bool,
    pub calls: Concurrency,
    pub requests: Mutex<Vec<TranscriptionRequest>>,
}

impl ScriptedRecognizer {
    pub fn answering(text: &str) -> Self {
        Self::with_default(Ok(transcript(text)))
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::with_default(Err(error))
    }

    pub fn with_default(default: Result<TranscriptionResult, ProviderError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            delay: Duration::ZERO,
            panics: false,
            calls: Concurrency::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, result: Result<TranscriptionResult, ProviderError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panicking() -> Self {
        let mut recognizer = Self::answering("unused");
        recognizer.panics = true;
        recognizer
    }
}

pub fn transcript(text: &str) -> TranscriptionResult {
    TranscriptionResult {
        text: text.to_string(),
        confidence: 0.9,
        language: Some("en".to_string()),
    }
}

#[async_trait]
impl RecognitionProvider for ScriptedRecognizer {
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, ProviderError> {
        let _guard = self.calls.enter();
        self.requests.lock().unwrap().push(request);
        if self.panics {
            panic!("recognition provider bug");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.default.clone())
    }
}

/// Synthesis provider returning `frames` frames of 24 kHz mono audio per call.
pub struct ScriptedSynthesizer {
    script: Mutex<VecDeque<Result<SynthesizedAudio, ProviderError>>>,
    pub frames: usize,
    pub delay: Duration,
    pub calls: Concurrency,
    pub requests: Mutex<Vec<SynthesisRequest>>,
    pub panics: bool,
}

impl ScriptedSynthesizer {
    pub fn new(frames: usize) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            frames,
            delay: Duration::ZERO,
            calls: Concurrency::default(),
            requests: Mutex::new(Vec::new()),
            panics: false,
        }
    }

    pub fn then(self, result: Result<SynthesizedAudio, ProviderError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn audio(&self) -> SynthesizedAudio {
        // 20 ms at 24 kHz mono is 480 samples.
        SynthesizedAudio {
            samples: vec![4000; 480 * self.frames],
            sample_rate: 24_000,
            channels: 1,
        }
    }
}

#[async_trait]
impl SynthesisProvider for ScriptedSynthesizer {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesizedAudio, ProviderError> {
        let _guard = self.calls.enter();
        self.requests.lock().unwrap().push(request);
        if self.panics {
            panic!("recognition provider bug");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.audio()))
    }
}

/// Agent that records every request and answers with a fixed reply.
pub struct RecordingAgent {
    pub reply: String,
    pub delay: Duration,
    pub error: Option<AgentError>,
    pub calls: Mutex<Vec<(GuildId, String)>>,
}

impl RecordingAgent {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: Duration::ZERO,
            error: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(GuildId, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for RecordingAgent {
    async fn respond(&self, guild: &GuildId, text: &str) -> Result<String, AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((guild.clone(), text.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.reply.clone()),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub posts: Mutex<Vec<(GuildId, Option<ChannelId>, String)>>,
}

impl RecordingNotifier {
    pub fn texts(&self) -> Vec<String> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl TextNotifier for RecordingNotifier {
    async fn post(&self, guild: &GuildId, channel: Option<&ChannelId>, text: &str) {
        self.posts
            .lock()
            .unwrap()
            .push((guild.clone(), channel.cloned(), text.to_string()));
    }
}

// --- harness ---

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub transport: Arc<RecordingTransport>,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub synthesizer: Arc<ScriptedSynthesizer>,
    pub agent: Arc<RecordingAgent>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(
        config: PipelineConfig,
        recognizer: ScriptedRecognizer,
        synthesizer: ScriptedSynthesizer,
        agent: RecordingAgent,
    ) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let recognizer = Arc::new(recognizer);
        let synthesizer = Arc::new(synthesizer);
        let agent = Arc::new(agent);
        let notifier = Arc::new(RecordingNotifier::default());
        let providers = Providers {
            recognition: recognizer.clone(),
            synthesis: synthesizer.clone(),
            agent: agent.clone(),
            transport: transport.clone(),
            notifier: notifier.clone(),
        };
        let manager = Arc::new(SessionManager::new(config, providers).unwrap());
        Self {
            manager,
            transport,
            recognizer,
            synthesizer,
            agent,
            notifier,
        }
    }
}

/// Durations shrunk so simulated turns stay short.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.gate.hangover_ms = 100;
    config.recognition.min_utterance_ms = 100;
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 40;
    config.session.self_user = Some("parley".into());
    config
}

/// A simulated speaker sending 20 ms packets in real time.
///
/// Sequence numbers advance per packet sent; timestamps advance with time,
/// including pauses, like an RTP sender.
pub struct Speaker {
    pub user: String,
    sequence: u16,
    timestamp: u32,
}

impl Speaker {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn packet(&mut self, amplitude: i16) -> InboundPacket {
        let mut payload = Vec::with_capacity(SAMPLES_PER_FRAME * 2);
        for _ in 0..SAMPLES_PER_FRAME {
            payload.extend_from_slice(&amplitude.to_le_bytes());
        }
        let frame = EncodedFrame::new(self.sequence, self.timestamp, payload);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_CHANNEL as u32);
        InboundPacket::new(self.user.as_str(), frame)
    }

    /// Sends `frames` loud packets, one per frame interval.
    pub async fn talk(&mut self, manager: &SessionManager, guild: &GuildId, frames: usize) {
        for _ in 0..frames {
            let packet = self.packet(8000);
            manager.deliver_audio(guild, packet).await;
            tokio::time::sleep(FRAME_DURATION).await;
        }
    }

    /// Stays quiet for `duration`; timestamps keep running.
    pub async fn pause(&mut self, duration: Duration) {
        let frames = (duration.as_millis() / FRAME_DURATION.as_millis()) as u32;
        self.timestamp = self
            .timestamp
            .wrapping_add(frames * SAMPLES_PER_CHANNEL as u32);
        tokio::time::sleep(duration).await;
    }
}

/// Waits (in simulated time) for the first event matching `pred`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for session event")
}

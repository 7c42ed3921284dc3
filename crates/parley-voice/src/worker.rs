//! The per-session worker.
//!
//! Each session runs on one task that owns every piece of its mutable state:
//! the jitter buffer, decoder, gate, recognizer buffer and state machine. The
//! 20 ms audio tick, inbound packets, commands and results of network calls
//! are multiplexed through a single `select!` loop, so session state is only
//! ever touched sequentially.
//!
//! Network calls never run on the tick. They are spawned with a per-turn
//! cancellation token and report back through a results channel; results
//! tagged with an older generation (from before a reset or stop) are dropped
//! on arrival.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineErrorKind, Phase};
use crate::event::SessionEvent;
use crate::playback::PlaybackScheduler;
use crate::provider::{
    AgentBackend, RecognitionProvider, SynthesisProvider, TextNotifier, VoiceTransport,
};
use crate::recognizer::{Recognition, SpeechRecognizer, Utterance};
use crate::router::{CommandRouter, RouteOutcome};
use crate::session::{ErrorOutcome, GuildVoiceSession, SessionSnapshot, SessionState, StopReason};
use crate::synthesizer::{SpeechSynthesizer, SynthesisStream};
use parley_audio::{
    CodecContext, FrameDecoder, GateEvent, JitterBuffer, Playout, VoiceActivityGate,
};
use parley_types::{
    ChannelId, GatewayEvent, GuildId, InboundPacket, PcmFrame, UserId, FRAME_DURATION,
    SAMPLES_PER_CHANNEL,
};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the command channel into a session.
const COMMAND_CAPACITY: usize = 32;

/// Capacity of the channel carrying network results back to a session.
const RESULT_CAPACITY: usize = 16;

/// External collaborators shared by all sessions.
#[derive(Clone)]
pub struct Providers {
    pub recognition: Arc<dyn RecognitionProvider>,
    pub synthesis: Arc<dyn SynthesisProvider>,
    pub agent: Arc<dyn AgentBackend>,
    pub transport: Arc<dyn VoiceTransport>,
    pub notifier: Arc<dyn TextNotifier>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers").finish_non_exhaustive()
    }
}

impl Providers {
    /// Wires both speech providers to one OpenAI-compatible endpoint and
    /// logs text notices.
    pub fn openai(
        http: crate::http::HttpProviderConfig,
        agent: Arc<dyn AgentBackend>,
        transport: Arc<dyn VoiceTransport>,
    ) -> Result<Self, crate::error::ProviderError> {
        let speech = Arc::new(crate::http::OpenAiSpeechClient::new(http)?);
        Ok(Self {
            recognition: speech.clone(),
            synthesis: speech,
            agent,
            transport,
            notifier: Arc::new(crate::provider::LogNotifier),
        })
    }
}

pub(crate) type AskReply = oneshot::Sender<Result<RouteOutcome, PipelineError>>;

pub(crate) enum Command {
    Stop {
        reason: StopReason,
        done: oneshot::Sender<()>,
    },
    Ask {
        text: String,
        reply: AskReply,
    },
    Gateway(GatewayEvent),
}

enum Origin {
    Voice,
    Text { reply: AskReply, speak: bool },
}

struct SpeechReport {
    chunks: usize,
    retries: u32,
}

enum TaskResult {
    Recognized {
        generation: u64,
        speaker: Option<UserId>,
        result: Result<Recognition, PipelineError>,
    },
    Routed {
        generation: u64,
        origin: Origin,
        result: Result<RouteOutcome, PipelineError>,
    },
    SpeechStarted {
        generation: u64,
    },
    SpeechFinished {
        generation: u64,
        text: String,
        result: Result<SpeechReport, PipelineError>,
    },
    /// The task panicked before producing a result.
    Crashed {
        generation: u64,
        phase: Phase,
        /// Text posted to the channel in place of the lost result.
        notice: Option<String>,
    },
}

impl TaskResult {
    fn generation(&self) -> u64 {
        match self {
            Self::Recognized { generation, .. }
            | Self::Routed { generation, .. }
            | Self::SpeechStarted { generation }
            | Self::SpeechFinished { generation, .. }
            | Self::Crashed { generation, .. } => *generation,
        }
    }
}

/// Manager-side handle to a running session.
pub(crate) struct SessionHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) inbound: mpsc::Sender<InboundPacket>,
    pub(crate) snapshot: watch::Receiver<SessionSnapshot>,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    /// Whether the session still owns the guild. A session counts from the
    /// moment it is spawned, while still `Connecting`.
    pub(crate) fn is_alive(&self) -> bool {
        !self.task.is_finished() && self.snapshot.borrow().state != SessionState::Off
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }
}

pub(crate) type ConnectOutcome = oneshot::Receiver<Result<SessionSnapshot, PipelineError>>;

/// Builds a session and spawns its worker.
///
/// The returned receiver resolves once the transport has joined the channel
/// (or failed to).
pub(crate) fn spawn_session(
    guild: GuildId,
    channel: ChannelId,
    config: Arc<PipelineConfig>,
    providers: Providers,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> Result<(SessionHandle, ConnectOutcome), PipelineError> {
    let codec = CodecContext::new(config.codec)
        .map_err(|e| PipelineError::from_codec(&guild, Phase::Connect, &e))?;
    let (decoder, encoder) = codec.into_parts();

    // The handle must look alive before the worker first runs, or a racing
    // join would spawn a second session for the guild.
    let mut session =
        GuildVoiceSession::new(guild.clone(), channel, config.session.error_ceiling);
    let from = session
        .transition(SessionState::Connecting)
        .map_err(|e| {
            PipelineError::new(
                PipelineErrorKind::TransportUnavailable,
                guild.clone(),
                Phase::Connect,
                e.to_string(),
            )
        })?;
    let _ = events.send(SessionEvent::StateChanged {
        guild: guild.clone(),
        from,
        to: SessionState::Connecting,
    });
    let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.session.inbound_capacity);
    let (results_tx, results_rx) = mpsc::channel(RESULT_CAPACITY);
    let (connected_tx, connected_rx) = oneshot::channel();

    let profile = &config.synthesis.profile;
    let recognizer = SpeechRecognizer::new(
        guild.clone(),
        Arc::clone(&providers.recognition),
        config.recognition.clone(),
        config.retry.clone(),
        profile.language.clone(),
    );
    let synthesizer = SpeechSynthesizer::new(
        guild.clone(),
        Arc::clone(&providers.synthesis),
        config.synthesis.clone(),
        config.retry.clone(),
    );
    let router = CommandRouter::new(Arc::clone(&providers.agent), config.routing.clone());

    let worker = SessionWorker {
        last_state: session.state(),
        session,
        jitter: JitterBuffer::new(config.jitter.clone()),
        gate: VoiceActivityGate::new(config.gate.clone()),
        decoder,
        encoder: Some(encoder),
        recognizer,
        synthesizer,
        router,
        playback: None,
        pending: None,
        utterance_speaker: None,
        stream_owner: None,
        clock: 0,
        generation: 0,
        turn_cancel: cancel.child_token(),
        cancel: cancel.clone(),
        results_tx,
        results_rx,
        commands: command_rx,
        inbound: inbound_rx,
        events,
        snapshot_tx,
        stop_ack: None,
        config,
        providers,
    };
    let task = tokio::spawn(worker.run(connected_tx));

    let handle = SessionHandle {
        commands: command_tx,
        inbound: inbound_tx,
        snapshot: snapshot_rx,
        cancel,
        task,
    };
    Ok((handle, connected_rx))
}

struct SessionWorker {
    session: GuildVoiceSession,
    last_state: SessionState,
    config: Arc<PipelineConfig>,
    providers: Providers,
    jitter: JitterBuffer,
    decoder: Box<dyn FrameDecoder>,
    /// Held until playback starts after the transport connects.
    encoder: Option<Box<dyn parley_audio::FrameEncoder>>,
    gate: VoiceActivityGate,
    recognizer: SpeechRecognizer,
    synthesizer: SpeechSynthesizer,
    router: CommandRouter,
    playback: Option<PlaybackScheduler>,
    /// Completed utterance waiting for the session to return to `Listening`.
    pending: Option<(Option<UserId>, Utterance)>,
    utterance_speaker: Option<UserId>,
    /// User whose packets the jitter buffer currently holds.
    stream_owner: Option<UserId>,
    /// Frames processed so far; positions frames on the session's own clock.
    clock: u32,
    generation: u64,
    turn_cancel: CancellationToken,
    cancel: CancellationToken,
    results_tx: mpsc::Sender<TaskResult>,
    results_rx: mpsc::Receiver<TaskResult>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<InboundPacket>,
    events: broadcast::Sender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    stop_ack: Option<oneshot::Sender<()>>,
}

impl SessionWorker {
    async fn run(mut self, connected: oneshot::Sender<Result<SessionSnapshot, PipelineError>>) {
        if let Err(err) = self.connect().await {
            self.set_state(SessionState::Off);
            self.emit(SessionEvent::Stopped {
                guild: self.guild().clone(),
                reason: StopReason::ConnectFailed,
            });
            let _ = connected.send(Err(err));
            return;
        }
        let _ = connected.send(Ok(self.session.snapshot()));

        let mut tick = tokio::time::interval(FRAME_DURATION);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            let flow = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => ControlFlow::Break(StopReason::Requested),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => ControlFlow::Break(StopReason::Requested),
                },
                Some(result) = self.results_rx.recv() => self.on_result(result),
                _ = tick.tick() => self.on_tick(),
                Some(packet) = self.inbound.recv() => {
                    self.on_packet(packet);
                    ControlFlow::Continue(())
                }
            };
            self.publish();
            if let ControlFlow::Break(reason) = flow {
                break reason;
            }
        };

        self.shutdown(reason).await;
    }

    fn guild(&self) -> &GuildId {
        self.session.guild()
    }

    async fn connect(&mut self) -> Result<(), PipelineError> {
        let guild = self.guild().clone();
        let channel = self
            .session
            .channel()
            .cloned()
            .ok_or_else(|| PipelineError::disconnected(&guild, Phase::Connect))?;
        let deadline = self.config.session.connect_timeout();
        let transport = Arc::clone(&self.providers.transport);

        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::disconnected(&guild, Phase::Connect)),
            joined = tokio::time::timeout(deadline, transport.connect(&guild, &channel)) => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(PipelineError::from_transport(&guild, Phase::Connect, &e)),
                Err(_) => Err(PipelineError::new(
                    PipelineErrorKind::TransportUnavailable,
                    guild.clone(),
                    Phase::Connect,
                    format!("voice connect timed out after {}ms", deadline.as_millis()),
                )),
            },
        };
        if let Err(err) = &joined {
            warn!(guild = %guild, channel = %channel, error = %err, "voice connect failed");
            return joined;
        }

        if let Some(encoder) = self.encoder.take() {
            self.playback = Some(PlaybackScheduler::spawn(
                guild.clone(),
                encoder,
                transport,
                &self.config.playback,
                self.cancel.child_token(),
            ));
        }
        self.session.touch(Instant::now());
        self.set_state(SessionState::Listening);
        info!(guild = %guild, channel = %channel, session = %self.session.id(), "voice session listening");
        Ok(())
    }

    // --- inputs ---

    fn on_packet(&mut self, packet: InboundPacket) {
        let InboundPacket { user, frame } = packet;
        self.session.saw_user(&user);
        if !self.session.claim_floor(&user) {
            trace!(guild = %self.guild(), user = %user, "packet dropped, floor held by another speaker");
            return;
        }
        if self.stream_owner.as_ref() != Some(&user) {
            debug!(guild = %self.guild(), user = %user, "speaker stream switched");
            self.jitter.reset();
            self.stream_owner = Some(user);
        }
        let now = Instant::now();
        self.session.touch(now);
        self.jitter.push(frame, now.into_std());
    }

    fn on_tick(&mut self) -> ControlFlow<StopReason> {
        if let Some(reason) = self.check_timeouts(Instant::now()) {
            return ControlFlow::Break(reason);
        }

        match self.jitter.pop() {
            Some(Playout::Frame(entry)) => match self.decoder.decode(&entry.frame) {
                Ok(pcm) => self.process_frame(pcm),
                Err(e) => {
                    let err = PipelineError::from_codec(self.guild(), Phase::Decode, &e);
                    return self.fail(err);
                }
            },
            Some(Playout::Concealed {
                sequence,
                timestamp,
            }) => {
                let pcm = self.decoder.conceal(sequence, timestamp);
                self.process_frame(pcm);
            }
            None if self.gate.in_utterance() => {
                // The stream went quiet mid-utterance; keep the hangover running.
                self.process_frame(PcmFrame::silence(0, 0));
            }
            None => {
                if self.jitter.is_idle() && self.session.speaker().is_some() {
                    self.session.release_floor();
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn process_frame(&mut self, pcm: PcmFrame) {
        // Sender sequence numbers restart on resync; the clock never does.
        let pcm = pcm.restamp(
            self.clock as u16,
            self.clock.wrapping_mul(SAMPLES_PER_CHANNEL as u32),
        );
        self.clock = self.clock.wrapping_add(1);
        let classification = self.gate.classify(&pcm);
        match classification.event {
            Some(GateEvent::UtteranceStarted) => {
                self.utterance_speaker = self.session.speaker().cloned();
                self.recognizer.accumulate(pcm, classification.activity);
            }
            Some(GateEvent::UtteranceEnded { voiced, forced }) => {
                self.recognizer.accumulate(pcm, classification.activity);
                debug!(
                    guild = %self.guild(),
                    voiced_ms = voiced.as_millis() as u64,
                    forced,
                    "utterance complete"
                );
                self.finish_utterance();
            }
            None if self.gate.in_utterance() => {
                self.recognizer.accumulate(pcm, classification.activity);
            }
            None => {}
        }
    }

    fn finish_utterance(&mut self) {
        let utterance = self.recognizer.take_utterance();
        let speaker = self.utterance_speaker.take();
        self.session.release_floor();
        if self.session.state() == SessionState::Listening {
            self.dispatch_recognition(speaker, utterance);
        } else if self.pending.replace((speaker, utterance)).is_some() {
            debug!(guild = %self.guild(), "parked utterance replaced by a newer one");
        }
    }

    fn check_timeouts(&self, now: Instant) -> Option<StopReason> {
        if let Some(since) = self.session.empty_since() {
            if now.duration_since(since) >= self.config.session.empty_channel_timeout() {
                info!(guild = %self.guild(), "voice channel empty, stopping session");
                return Some(StopReason::ChannelEmpty);
            }
        }
        let idle = now.duration_since(self.session.last_activity());
        if self.session.state() == SessionState::Listening
            && !self.gate.in_utterance()
            && idle >= self.config.session.idle_timeout()
        {
            info!(guild = %self.guild(), idle_ms = idle.as_millis() as u64, "session idle, stopping");
            return Some(StopReason::IdleTimeout);
        }
        None
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<StopReason> {
        match command {
            Command::Stop { reason, done } => {
                self.stop_ack = Some(done);
                ControlFlow::Break(reason)
            }
            Command::Ask { text, reply } => {
                self.session.touch(Instant::now());
                let speak = self.config.routing.speak_text_answers;
                if self.session.state() == SessionState::Listening {
                    self.set_state(SessionState::Routing);
                    self.dispatch_route(text, Origin::Text { reply, speak });
                } else {
                    // Busy with a voice turn: answer without touching audio state.
                    let router = self.router.clone();
                    let guild = self.guild().clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {}
                            result = router.route(&guild, &text) => {
                                let _ = reply.send(result);
                            }
                        }
                    });
                }
                ControlFlow::Continue(())
            }
            Command::Gateway(event) => self.on_gateway(event),
        }
    }

    fn on_gateway(&mut self, event: GatewayEvent) -> ControlFlow<StopReason> {
        match event {
            GatewayEvent::VoiceStateChanged { user, channel, .. } => {
                if self.config.session.self_user.as_ref() == Some(&user) {
                    match channel {
                        None => return ControlFlow::Break(StopReason::Disconnected),
                        Some(channel) if Some(&channel) != self.session.channel() => {
                            info!(guild = %self.guild(), channel = %channel, "moved to another voice channel");
                            self.session.move_to(channel);
                        }
                        Some(_) => {}
                    }
                    return ControlFlow::Continue(());
                }
                self.session
                    .update_presence(&user, channel.as_ref(), Instant::now());
                if channel.as_ref() != self.session.channel()
                    && self.session.speaker() == Some(&user)
                {
                    self.session.release_floor();
                }
                ControlFlow::Continue(())
            }
            GatewayEvent::ChannelDeleted { channel, .. } => {
                if self.session.channel() == Some(&channel) {
                    ControlFlow::Break(StopReason::ChannelDeleted)
                } else {
                    ControlFlow::Continue(())
                }
            }
            GatewayEvent::GuildDeleted { .. } => ControlFlow::Break(StopReason::GuildDeleted),
        }
    }

    // --- network calls ---

    /// Runs `task` for the current turn and delivers its result.
    ///
    /// A panicking task is reported as [`TaskResult::Crashed`] so the turn
    /// still ends. Cancelling the turn aborts the task.
    fn spawn_task<F>(&self, phase: Phase, notice: Option<String>, task: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let results = self.results_tx.clone();
        let cancel = self.turn_cancel.clone();
        let generation = self.generation;
        let guild = self.guild().clone();
        let mut work = tokio::spawn(task);
        tokio::spawn(async move {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    work.abort();
                    return;
                }
                joined = &mut work => joined,
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    error!(guild = %guild, %phase, "network task panicked");
                    TaskResult::Crashed {
                        generation,
                        phase,
                        notice,
                    }
                }
                Err(_) => return,
            };
            let _ = results.send(result).await;
        });
    }

    fn dispatch_recognition(&mut self, speaker: Option<UserId>, utterance: Utterance) {
        self.set_state(SessionState::Recognizing);
        let generation = self.generation;
        let call = self.recognizer.transcribe(utterance);
        let notice = self.config.routing.recognition_failed_notice.clone();
        self.spawn_task(Phase::Recognition, Some(notice), async move {
            TaskResult::Recognized {
                generation,
                speaker,
                result: call.await,
            }
        });
    }

    fn dispatch_route(&mut self, text: String, origin: Origin) {
        let generation = self.generation;
        let router = self.router.clone();
        let guild = self.guild().clone();
        self.spawn_task(Phase::Routing, None, async move {
            let result = router.route(&guild, &text).await;
            TaskResult::Routed {
                generation,
                origin,
                result,
            }
        });
    }

    fn dispatch_pending(&mut self) {
        if self.session.state() != SessionState::Listening {
            return;
        }
        if let Some((speaker, utterance)) = self.pending.take() {
            debug!(guild = %self.guild(), frames = utterance.len(), "dispatching parked utterance");
            self.dispatch_recognition(speaker, utterance);
        }
    }

    fn start_speaking(&mut self, text: String) {
        let Some(playback) = self.playback.clone() else {
            warn!(guild = %self.guild(), "no playback available, reply not spoken");
            self.finish_turn();
            return;
        };
        self.set_state(SessionState::Synthesizing);
        let generation = self.generation;
        let stream = self.synthesizer.synthesize(&text, self.turn_cancel.child_token());
        let results = self.results_tx.clone();
        self.spawn_task(
            Phase::Synthesis,
            Some(text.clone()),
            speak(stream, playback, results, generation, text),
        );
    }

    fn on_result(&mut self, result: TaskResult) -> ControlFlow<StopReason> {
        if result.generation() != self.generation {
            debug!(guild = %self.guild(), "stale result discarded");
            if let TaskResult::Routed {
                origin: Origin::Text { reply, .. },
                result,
                ..
            } = result
            {
                let _ = reply.send(result);
            }
            return ControlFlow::Continue(());
        }

        match result {
            TaskResult::Recognized {
                speaker, result, ..
            } => match result {
                Ok(Recognition::Discarded { .. }) => {
                    self.set_state(SessionState::Listening);
                    self.dispatch_pending();
                    ControlFlow::Continue(())
                }
                Ok(Recognition::Transcribed { result, retries }) => {
                    let text = result.text.trim().to_string();
                    if text.is_empty() {
                        debug!(guild = %self.guild(), "empty transcript, turn ended");
                        self.set_state(SessionState::Listening);
                        self.dispatch_pending();
                        return ControlFlow::Continue(());
                    }
                    info!(
                        guild = %self.guild(),
                        confidence = result.confidence,
                        retries,
                        "utterance transcribed"
                    );
                    self.emit(SessionEvent::Transcript {
                        guild: self.guild().clone(),
                        speaker,
                        text: text.clone(),
                        confidence: result.confidence,
                        retries,
                    });
                    self.session.touch(Instant::now());
                    self.set_state(SessionState::Routing);
                    self.dispatch_route(text, Origin::Voice);
                    ControlFlow::Continue(())
                }
                Err(err) => {
                    let notice = self.config.routing.recognition_failed_notice.clone();
                    self.notify(notice);
                    self.fail(err)
                }
            },
            TaskResult::Routed { origin, result, .. } => self.on_routed(origin, result),
            TaskResult::SpeechStarted { .. } => {
                if self.session.state() == SessionState::Synthesizing {
                    self.set_state(SessionState::Playing);
                }
                ControlFlow::Continue(())
            }
            TaskResult::SpeechFinished { text, result, .. } => match result {
                Ok(report) => {
                    self.emit(SessionEvent::Spoken {
                        guild: self.guild().clone(),
                        chunks: report.chunks,
                        retries: report.retries,
                    });
                    self.finish_turn();
                    ControlFlow::Continue(())
                }
                Err(err) => {
                    if err.kind != PipelineErrorKind::DisconnectedMidOperation {
                        // Speech failed; the answer still reaches the user as text.
                        self.notify(text);
                    }
                    self.fail(err)
                }
            },
            TaskResult::Crashed { phase, notice, .. } => {
                if let Some(notice) = notice {
                    self.notify(notice);
                }
                let err = PipelineError::new(
                    PipelineErrorKind::ProviderUnavailable,
                    self.guild().clone(),
                    phase,
                    "provider call panicked",
                );
                self.fail(err)
            }
        }
    }

    fn on_routed(
        &mut self,
        origin: Origin,
        result: Result<RouteOutcome, PipelineError>,
    ) -> ControlFlow<StopReason> {
        match result {
            Ok(outcome) => {
                self.emit(SessionEvent::Reply {
                    guild: self.guild().clone(),
                    text: outcome.text.clone(),
                    timed_out: outcome.timed_out,
                });
                self.session.touch(Instant::now());
                let speak = match origin {
                    Origin::Voice => true,
                    Origin::Text { reply, speak } => {
                        let _ = reply.send(Ok(outcome.clone()));
                        speak
                    }
                };
                if speak && !outcome.text.trim().is_empty() {
                    self.start_speaking(outcome.text);
                } else {
                    self.finish_turn();
                }
                ControlFlow::Continue(())
            }
            Err(err) => {
                if let Origin::Text { reply, .. } = origin {
                    let _ = reply.send(Err(err.clone()));
                }
                self.fail(err)
            }
        }
    }

    fn finish_turn(&mut self) {
        self.session.record_success();
        self.session.touch(Instant::now());
        self.set_state(SessionState::Listening);
        self.dispatch_pending();
    }

    fn notify(&self, text: String) {
        let notifier = Arc::clone(&self.providers.notifier);
        let guild = self.guild().clone();
        let channel = self.session.channel().cloned();
        tokio::spawn(async move {
            notifier.post(&guild, channel.as_ref(), &text).await;
        });
    }

    // --- failure and lifecycle ---

    fn fail(&mut self, err: PipelineError) -> ControlFlow<StopReason> {
        let outcome = self.session.record_error(&err);
        self.publish();
        match outcome {
            ErrorOutcome::Ignored => {
                info!(guild = %self.guild(), error = %err, "transport disconnected");
                ControlFlow::Break(StopReason::Disconnected)
            }
            ErrorOutcome::Reset { consecutive } => {
                self.emit(SessionEvent::Error {
                    guild: self.guild().clone(),
                    error: err,
                    consecutive,
                });
                self.reset_pipeline();
                if let Err(e) = self.session.recover() {
                    warn!(guild = %self.guild(), error = %e, "session could not recover");
                }
                self.publish();
                ControlFlow::Continue(())
            }
            ErrorOutcome::ForcedOff { consecutive } => {
                warn!(guild = %self.guild(), consecutive, "error ceiling exceeded, forcing session off");
                self.emit(SessionEvent::Error {
                    guild: self.guild().clone(),
                    error: err,
                    consecutive,
                });
                ControlFlow::Break(StopReason::ErrorCeiling)
            }
        }
    }

    /// Cancels in-flight calls and clears every buffer.
    fn reset_pipeline(&mut self) {
        self.generation += 1;
        self.turn_cancel.cancel();
        self.turn_cancel = self.cancel.child_token();
        self.jitter.reset();
        self.gate.reset();
        self.recognizer.discard();
        self.pending = None;
        self.utterance_speaker = None;
        self.stream_owner = None;
        self.session.release_floor();

        let restart = match &self.playback {
            Some(playback) if playback.is_stopped() => true,
            Some(playback) => {
                playback.flush();
                false
            }
            None => false,
        };
        if restart {
            self.restart_playback();
        }
    }

    fn restart_playback(&mut self) {
        match CodecContext::new(self.config.codec) {
            Ok(codec) => {
                let (_, encoder) = codec.into_parts();
                self.playback = Some(PlaybackScheduler::spawn(
                    self.guild().clone(),
                    encoder,
                    Arc::clone(&self.providers.transport),
                    &self.config.playback,
                    self.cancel.child_token(),
                ));
                debug!(guild = %self.guild(), "playback restarted");
            }
            Err(e) => {
                warn!(guild = %self.guild(), error = %e, "failed to restart playback");
                self.playback = None;
            }
        }
    }

    async fn shutdown(&mut self, reason: StopReason) {
        self.generation += 1;
        self.turn_cancel.cancel();
        if let Some(playback) = &self.playback {
            playback.stop();
        }
        self.cancel.cancel();
        self.jitter.reset();
        self.gate.reset();
        self.recognizer.discard();
        self.pending = None;

        if self.session.state() != SessionState::Off {
            self.set_state(SessionState::Off);
        }
        self.providers.transport.disconnect(self.session.guild()).await;

        info!(guild = %self.guild(), ?reason, "voice session stopped");
        self.emit(SessionEvent::Stopped {
            guild: self.guild().clone(),
            reason,
        });
        if let Some(ack) = self.stop_ack.take() {
            let _ = ack.send(());
        }
    }

    // --- observability ---

    fn set_state(&mut self, to: SessionState) {
        if self.session.state() == to {
            return;
        }
        if let Err(e) = self.session.transition(to) {
            debug!(guild = %self.guild(), error = %e, "transition skipped");
        }
        self.publish();
    }

    /// Emits a state change if one happened and refreshes the snapshot.
    fn publish(&mut self) {
        let state = self.session.state();
        if state != self.last_state {
            let from = std::mem::replace(&mut self.last_state, state);
            self.emit(SessionEvent::StateChanged {
                guild: self.guild().clone(),
                from,
                to: state,
            });
        }
        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn speak(
    mut stream: SynthesisStream,
    playback: PlaybackScheduler,
    results: mpsc::Sender<TaskResult>,
    generation: u64,
    text: String,
) -> TaskResult {
    let mut chunks = 0usize;
    let mut retries = 0u32;
    let streamed = loop {
        match stream.next().await {
            None => break Ok(()),
            Some(Err(err)) => break Err(err),
            Some(Ok(chunk)) => {
                if chunks == 0 {
                    let _ = results.send(TaskResult::SpeechStarted { generation }).await;
                }
                chunks += 1;
                retries += chunk.retries;
                if let Err(err) = playback.enqueue(&chunk.samples).await {
                    break Err(err);
                }
            }
        }
    };
    let result = match streamed {
        Ok(()) => playback
            .wait_idle()
            .await
            .map(|()| SpeechReport { chunks, retries }),
        Err(err) => Err(err),
    };
    TaskResult::SpeechFinished {
        generation,
        text,
        result,
    }
}

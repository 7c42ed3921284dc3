//! Real-time paced playback.
//!
//! Synthesized PCM is cut into 20 ms frames and queued. A pacing task pops
//! one frame per tick, encodes it and hands it to the transport with the next
//! sequence number and timestamp, so the transport sees real-time delivery
//! rather than bursts. After the queue drains a few silence frames are sent
//! to let the remote decoder fade out cleanly.
//!
//! The queue is bounded; `enqueue` waits for space. `flush` and `stop` discard
//! queued audio synchronously.

use crate::config::PlaybackConfig;
use crate::error::{PipelineError, Phase};
use crate::provider::VoiceTransport;
use parley_audio::FrameEncoder;
use parley_types::{EncodedFrame, GuildId, FRAME_DURATION, SAMPLES_PER_CHANNEL, SAMPLES_PER_FRAME};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Playback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Audio frames handed to the transport.
    pub sent: u64,
    /// Trailing silence frames handed to the transport.
    pub silence_sent: u64,
    /// Queued frames dropped by `flush` or `stop`.
    pub discarded: u64,
    /// Frames currently waiting.
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Queue {
    frames: VecDeque<Vec<i16>>,
    trailing: u32,
    in_flight: bool,
    closed: bool,
    failure: Option<PipelineError>,
}

impl Queue {
    fn is_idle(&self) -> bool {
        self.frames.is_empty() && self.trailing == 0 && !self.in_flight
    }
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    space: Notify,
    idle: Notify,
    sent: AtomicU64,
    silence_sent: AtomicU64,
    discarded: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A poisoned queue only means a holder panicked; the data is still usable.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discard_all(&self, queue: &mut Queue) {
        let dropped = queue.frames.len() as u64;
        queue.frames.clear();
        queue.trailing = 0;
        if dropped > 0 {
            self.discarded.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    fn wake_all(&self) {
        self.space.notify_waiters();
        self.idle.notify_waiters();
    }
}

enum Next {
    Audio(Vec<i16>),
    Silence,
}

/// Handle to one session's playback queue and pacing task.
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    guild: GuildId,
    shared: Arc<Shared>,
    capacity: usize,
    trailing_silence: u32,
    cancel: CancellationToken,
}

impl PlaybackScheduler {
    /// Spawns the pacing task. It runs until `stop` or until `cancel` fires.
    pub fn spawn(
        guild: GuildId,
        encoder: Box<dyn FrameEncoder>,
        transport: Arc<dyn VoiceTransport>,
        config: &PlaybackConfig,
        cancel: CancellationToken,
    ) -> Self {
        let scheduler = Self {
            guild,
            shared: Arc::new(Shared::default()),
            capacity: config.queue_frames(),
            trailing_silence: config.trailing_silence_frames,
            cancel,
        };
        tokio::spawn(pace(
            scheduler.guild.clone(),
            Arc::clone(&scheduler.shared),
            encoder,
            transport,
            scheduler.cancel.clone(),
        ));
        scheduler
    }

    /// Queues a chunk of transport PCM, waiting for space as needed.
    ///
    /// Returns the number of frames queued. The last frame is zero-padded.
    ///
    /// # Errors
    ///
    /// Fails with `DisconnectedMidOperation` (or the transport or encoder
    /// failure that closed the queue) once the scheduler has stopped.
    pub async fn enqueue(&self, pcm: &[i16]) -> Result<usize, PipelineError> {
        let mut count = 0;
        for chunk in pcm.chunks(SAMPLES_PER_FRAME) {
            let mut frame = chunk.to_vec();
            frame.resize(SAMPLES_PER_FRAME, 0);
            self.push_frame(frame).await?;
            count += 1;
        }
        Ok(count)
    }

    async fn push_frame(&self, frame: Vec<i16>) -> Result<(), PipelineError> {
        let mut frame = Some(frame);
        loop {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.shared.lock();
                if queue.closed {
                    return Err(self.closed_error(&queue));
                }
                if queue.frames.len() < self.capacity {
                    if let Some(frame) = frame.take() {
                        queue.frames.push_back(frame);
                    }
                    queue.trailing = self.trailing_silence;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Waits until every queued frame and the trailing silence have been sent.
    pub async fn wait_idle(&self) -> Result<(), PipelineError> {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let queue = self.shared.lock();
                if queue.closed {
                    return Err(self.closed_error(&queue));
                }
                if queue.is_idle() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Discards queued audio; the scheduler keeps running.
    pub fn flush(&self) {
        let mut queue = self.shared.lock();
        self.shared.discard_all(&mut queue);
        drop(queue);
        self.shared.wake_all();
    }

    /// Discards queued audio and stops the pacing task. No frame is sent
    /// after this returns.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut queue = self.shared.lock();
        queue.closed = true;
        self.shared.discard_all(&mut queue);
        drop(queue);
        self.shared.wake_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().closed
    }

    /// The transport or encoder failure that stopped playback, if any.
    pub fn failure(&self) -> Option<PipelineError> {
        self.shared.lock().failure.clone()
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            silence_sent: self.shared.silence_sent.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            queued: self.shared.lock().frames.len(),
        }
    }

    fn closed_error(&self, queue: &Queue) -> PipelineError {
        queue
            .failure
            .clone()
            .unwrap_or_else(|| PipelineError::disconnected(&self.guild, Phase::Playback))
    }
}

async fn pace(
    guild: GuildId,
    shared: Arc<Shared>,
    mut encoder: Box<dyn FrameEncoder>,
    transport: Arc<dyn VoiceTransport>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(FRAME_DURATION);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let silence = vec![0i16; SAMPLES_PER_FRAME];
    let mut sequence: u16 = 0;
    let mut timestamp: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let next = {
            let mut queue = shared.lock();
            let next = if let Some(frame) = queue.frames.pop_front() {
                Some(Next::Audio(frame))
            } else if queue.trailing > 0 {
                queue.trailing -= 1;
                Some(Next::Silence)
            } else {
                None
            };
            queue.in_flight = next.is_some();
            next
        };
        let Some(next) = next else {
            continue;
        };
        shared.space.notify_waiters();

        let (samples, is_silence) = match &next {
            Next::Audio(frame) => (frame.as_slice(), false),
            Next::Silence => (silence.as_slice(), true),
        };
        let payload = match encoder.encode(samples) {
            Ok(payload) => payload,
            Err(e) => {
                let failure = PipelineError::from_codec(&guild, Phase::Playback, &e);
                error!(guild = %guild, sequence, error = %failure, "failed to encode playback frame");
                shared.lock().failure = Some(failure);
                break;
            }
        };

        if cancel.is_cancelled() {
            break;
        }
        let frame = EncodedFrame::new(sequence, timestamp, payload);
        if let Err(e) = transport.send_frame(&guild, frame).await {
            let failure = PipelineError::from_transport(&guild, Phase::Playback, &e);
            warn!(guild = %guild, error = %failure, "transport refused playback frame");
            let mut queue = shared.lock();
            queue.failure = Some(failure);
            break;
        }
        if is_silence {
            shared.silence_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.sent.fetch_add(1, Ordering::Relaxed);
        }
        sequence = sequence.wrapping_add(1);
        timestamp = timestamp.wrapping_add(SAMPLES_PER_CHANNEL as u32);
        finish_frame(&shared);
    }

    let mut queue = shared.lock();
    queue.closed = true;
    queue.in_flight = false;
    shared.discard_all(&mut queue);
    drop(queue);
    shared.wake_all();
    debug!(guild = %guild, "playback stopped");
}

fn finish_frame(shared: &Shared) {
    let mut queue = shared.lock();
    queue.in_flight = false;
    let idle = queue.is_idle();
    drop(queue);
    if idle {
        shared.idle.notify_waiters();
    }
}

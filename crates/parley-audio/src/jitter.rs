//! Inbound jitter buffer.
//!
//! Frames are held in a bounded window keyed by sequence number and released
//! one per 20 ms tick in sequence order. A missing frame is replaced by a
//! single concealment slot and the expected counter moves on, so one lost
//! packet never stalls the pipeline.
//!
//! Sequence numbers are 16-bit and wrap; internally they are extended to a
//! monotonically growing `i64` relative to the current playout position.

use parley_types::{EncodedFrame, FRAME_DURATION_MS, SAMPLES_PER_CHANNEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

/// Extended sequence numbers start here so wrap-backs never go negative.
const SEQ_ORIGIN: i64 = 1 << 32;

fn default_window_ms() -> u64 {
    200
}

fn default_prefill_frames() -> usize {
    3
}

fn default_max_concealed_run() -> u32 {
    50
}

/// Jitter buffer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterConfig {
    /// Reordering window in milliseconds. Default: 200 (10 frames).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Frames to collect (or ticks to wait) before playout starts. Default: 3.
    #[serde(default = "default_prefill_frames")]
    pub prefill_frames: usize,

    /// Consecutive concealed frames with an empty buffer after which the
    /// buffer goes idle. Default: 50 (1 s).
    #[serde(default = "default_max_concealed_run")]
    pub max_concealed_run: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            prefill_frames: default_prefill_frames(),
            max_concealed_run: default_max_concealed_run(),
        }
    }
}

impl JitterConfig {
    /// Window size in frames (at least one).
    pub fn capacity(&self) -> usize {
        ((self.window_ms / FRAME_DURATION_MS) as usize).max(1)
    }
}

/// A buffered frame and the instant it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferEntry {
    pub frame: EncodedFrame,
    pub arrived_at: Instant,
}

/// Result of [`JitterBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was stored for playout.
    Buffered,
    /// A frame with this sequence number is already buffered.
    Duplicate,
    /// The frame's slot was already played out or fell behind the window.
    Late,
}

/// One tick's worth of output from [`JitterBuffer::pop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playout {
    /// The expected frame was present.
    Frame(JitterBufferEntry),
    /// The expected frame was missing; the caller substitutes silence.
    Concealed { sequence: u16, timestamp: u32 },
}

impl Playout {
    pub fn sequence(&self) -> u16 {
        match self {
            Self::Frame(entry) => entry.frame.sequence(),
            Self::Concealed { sequence, .. } => *sequence,
        }
    }
}

/// Counters describing buffer behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub received: u64,
    pub delivered: u64,
    pub concealed: u64,
    pub late_drops: u64,
    pub duplicates: u64,
    pub evicted: u64,
}

/// Bounded reordering window for one inbound stream.
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterConfig,
    capacity: usize,
    entries: BTreeMap<i64, JitterBufferEntry>,
    /// Next extended sequence to play; `None` until playout starts.
    next_seq: Option<i64>,
    highest: Option<i64>,
    last_emitted: Option<(i64, u32)>,
    prefill_ticks: usize,
    concealed_run: u32,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        let capacity = config.capacity();
        Self {
            config,
            capacity,
            entries: BTreeMap::new(),
            next_seq: None,
            highest: None,
            last_emitted: None,
            prefill_ticks: 0,
            concealed_run: 0,
            stats: JitterStats::default(),
        }
    }

    /// Stores a frame. Never blocks; overflow evicts the oldest entries.
    pub fn push(&mut self, frame: EncodedFrame, arrived_at: Instant) -> PushOutcome {
        self.stats.received += 1;
        let mut ext = self.extend(frame.sequence());
        if self.resumes_after_pause(ext, &frame) {
            // Senders stop transmitting in silence but keep their sequence
            // numbers running, so concealment has overtaken them.
            debug!(sequence = frame.sequence(), "sender resumed after a pause, restarting playout");
            self.go_idle();
            ext = self.extend(frame.sequence());
        }

        let behind_playout = self.next_seq.is_some_and(|next| ext < next);
        let behind_window = self
            .highest
            .is_some_and(|highest| ext <= highest - self.capacity as i64);
        if behind_playout || behind_window {
            self.stats.late_drops += 1;
            trace!(sequence = frame.sequence(), "late frame dropped");
            return PushOutcome::Late;
        }

        if self.entries.contains_key(&ext) {
            self.stats.duplicates += 1;
            trace!(sequence = frame.sequence(), "duplicate frame dropped");
            return PushOutcome::Duplicate;
        }

        self.entries.insert(ext, JitterBufferEntry { frame, arrived_at });
        self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));
        self.enforce_window();
        PushOutcome::Buffered
    }

    /// Releases the next frame in sequence, or a concealment slot if it is
    /// missing. Returns `None` while prefilling and once the stream has gone
    /// idle.
    pub fn pop(&mut self) -> Option<Playout> {
        let next = match self.next_seq {
            Some(next) => next,
            None => {
                if self.entries.is_empty() {
                    return None;
                }
                self.prefill_ticks += 1;
                let prefill = self.config.prefill_frames.max(1);
                if self.entries.len() < prefill && self.prefill_ticks < prefill {
                    return None;
                }
                let first = *self.entries.keys().next()?;
                self.next_seq = Some(first);
                first
            }
        };

        if self.entries.is_empty() && self.concealed_run >= self.config.max_concealed_run {
            debug!(
                concealed = self.concealed_run,
                "stream silent, jitter buffer going idle"
            );
            self.go_idle();
            return None;
        }

        self.next_seq = Some(next + 1);

        if let Some(entry) = self.entries.remove(&next) {
            self.concealed_run = 0;
            self.stats.delivered += 1;
            self.last_emitted = Some((next, entry.frame.timestamp()));
            return Some(Playout::Frame(entry));
        }

        self.concealed_run += 1;
        self.stats.concealed += 1;
        let timestamp = self.timestamp_for(next);
        self.last_emitted = Some((next, timestamp));
        Some(Playout::Concealed {
            sequence: next as u16,
            timestamp,
        })
    }

    /// Drops all buffered frames and forgets the playout position.
    /// Statistics are kept.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.go_idle();
    }

    /// True when nothing is buffered and playout has not started.
    pub fn is_idle(&self) -> bool {
        self.next_seq.is_none() && self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    fn go_idle(&mut self) {
        self.next_seq = None;
        self.highest = None;
        self.last_emitted = None;
        self.prefill_ticks = 0;
        self.concealed_run = 0;
    }

    /// A frame behind playout that is newer than the last slot played.
    fn resumes_after_pause(&self, ext: i64, frame: &EncodedFrame) -> bool {
        let behind = self.next_seq.is_some_and(|next| ext < next);
        let newer = self
            .last_emitted
            .is_some_and(|(_, ts)| frame.timestamp().wrapping_sub(ts) as i32 > 0);
        behind && newer && self.entries.is_empty() && self.concealed_run > 0
    }

    fn extend(&self, sequence: u16) -> i64 {
        match self.next_seq.or(self.highest) {
            Some(reference) => {
                let delta = sequence.wrapping_sub(reference as u16) as i16;
                reference + i64::from(delta)
            }
            None => SEQ_ORIGIN + i64::from(sequence),
        }
    }

    fn enforce_window(&mut self) {
        let Some(highest) = self.highest else {
            return;
        };
        let floor = highest - self.capacity as i64;

        while let Some((&oldest, _)) = self.entries.first_key_value() {
            if oldest > floor {
                break;
            }
            self.entries.pop_first();
            self.stats.evicted += 1;
        }

        if let Some(next) = self.next_seq {
            if next <= floor {
                debug!(skipped = floor + 1 - next, "jitter window overflow, skipping ahead");
                self.next_seq = Some(floor + 1);
            }
        }
    }

    fn timestamp_for(&self, ext: i64) -> u32 {
        let step = SAMPLES_PER_CHANNEL as u32;
        if let Some((seq, ts)) = self.last_emitted {
            return ts.wrapping_add(((ext - seq) as u32).wrapping_mul(step));
        }
        match self.entries.range(ext..).next() {
            Some((&seq, entry)) => entry
                .frame
                .timestamp()
                .wrapping_sub(((seq - ext) as u32).wrapping_mul(step)),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u16) -> EncodedFrame {
        EncodedFrame::new(
            sequence,
            u32::from(sequence).wrapping_mul(SAMPLES_PER_CHANNEL as u32),
            vec![sequence as u8],
        )
    }

    fn buffer() -> JitterBuffer {
        JitterBuffer::new(JitterConfig::default())
    }

    fn drain(buf: &mut JitterBuffer, ticks: usize) -> Vec<Playout> {
        (0..ticks).filter_map(|_| buf.pop()).collect()
    }

    #[test]
    fn reorders_frames_within_window() {
        let mut buf = buffer();
        let now = Instant::now();
        for seq in [3u16, 1, 0, 2, 5, 4] {
            assert_eq!(buf.push(frame(seq), now), PushOutcome::Buffered);
        }
        let out: Vec<u16> = drain(&mut buf, 6).iter().map(Playout::sequence).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(buf.stats().delivered, 6);
        assert_eq!(buf.stats().concealed, 0);
    }

    #[test]
    fn interleaved_push_and_pop_stays_strictly_increasing() {
        let mut buf = buffer();
        let now = Instant::now();
        let arrivals = [1u16, 0, 2, 4, 3, 6, 5, 8, 7, 9];
        let mut emitted = Vec::new();
        for seq in arrivals {
            buf.push(frame(seq), now);
            if let Some(p) = buf.pop() {
                emitted.push(p.sequence());
            }
        }
        emitted.extend(drain(&mut buf, 2).iter().map(Playout::sequence));
        assert_eq!(emitted, (0u16..10).collect::<Vec<_>>());
        assert_eq!(buf.stats().concealed, 0);
    }

    #[test]
    fn gap_is_filled_with_exactly_one_concealment_per_missing_frame() {
        let mut buf = buffer();
        let now = Instant::now();
        for seq in [10u16, 11, 14, 15] {
            buf.push(frame(seq), now);
        }
        let out = drain(&mut buf, 6);
        let seqs: Vec<u16> = out.iter().map(Playout::sequence).collect();
        assert_eq!(seqs, vec![10, 11, 12, 13, 14, 15]);
        let concealed: Vec<u16> = out
            .iter()
            .filter_map(|p| match p {
                Playout::Concealed { sequence, .. } => Some(*sequence),
                Playout::Frame(_) => None,
            })
            .collect();
        assert_eq!(concealed, vec![12, 13]);
        assert_eq!(buf.stats().concealed, 2);
    }

    #[test]
    fn concealed_timestamp_continues_the_stream() {
        let mut buf = buffer();
        let now = Instant::now();
        for seq in [0u16, 1, 3] {
            buf.push(frame(seq), now);
        }
        let out = drain(&mut buf, 3);
        assert_eq!(
            out[2],
            Playout::Concealed {
                sequence: 2,
                timestamp: 2 * SAMPLES_PER_CHANNEL as u32
            }
        );
    }

    #[test]
    fn already_played_frame_is_a_late_drop() {
        let mut buf = buffer();
        let now = Instant::now();
        for seq in [0u16, 1, 3] {
            buf.push(frame(seq), now);
        }
        drain(&mut buf, 3); // plays 0, 1, conceals 2
        assert_eq!(buf.push(frame(2), now), PushOutcome::Late);
        assert_eq!(buf.stats().late_drops, 1);
        let next = buf.pop().unwrap();
        assert_eq!(next.sequence(), 3);
    }

    #[test]
    fn sender_resuming_after_pause_restarts_playout() {
        let config = JitterConfig {
            prefill_frames: 1,
            ..JitterConfig::default()
        };
        let mut buf = JitterBuffer::new(config);
        let now = Instant::now();
        buf.push(frame(0), now);
        buf.push(frame(1), now);
        drain(&mut buf, 12); // plays 0, 1, then conceals 2..=11

        // Next packet carries sequence 2 but a timestamp 20 frames on.
        let resumed = EncodedFrame::new(2, 20 * SAMPLES_PER_CHANNEL as u32, vec![2]);
        assert_eq!(buf.push(resumed, now), PushOutcome::Buffered);
        assert_eq!(buf.pop().map(|p| p.sequence()), Some(2));
        assert_eq!(buf.stats().late_drops, 0);
    }

    #[test]
    fn duplicates_are_dropped_idempotently() {
        let mut buf = buffer();
        let now = Instant::now();
        assert_eq!(buf.push(frame(5), now), PushOutcome::Buffered);
        assert_eq!(buf.push(frame(5), now), PushOutcome::Duplicate);
        assert_eq!(buf.push(frame(5), now), PushOutcome::Duplicate);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.stats().duplicates, 2);
    }

    #[test]
    fn overflow_evicts_oldest_entries() {
        let mut buf = buffer();
        let now = Instant::now();
        for seq in 0u16..25 {
            buf.push(frame(seq), now);
        }
        assert_eq!(buf.len(), buf.capacity());
        assert_eq!(buf.stats().evicted, 15);
        assert_eq!(buf.pop().map(|p| p.sequence()), Some(15));
    }

    #[test]
    fn frame_far_behind_the_window_is_late() {
        let mut buf = buffer();
        let now = Instant::now();
        buf.push(frame(100), now);
        assert_eq!(buf.push(frame(80), now), PushOutcome::Late);
    }

    #[test]
    fn sequence_wraparound_keeps_order() {
        let mut buf = buffer();
        let now = Instant::now();
        for seq in [65534u16, 0, 65535, 1] {
            assert_eq!(buf.push(frame(seq), now), PushOutcome::Buffered);
        }
        let seqs: Vec<u16> = drain(&mut buf, 4).iter().map(Playout::sequence).collect();
        assert_eq!(seqs, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn single_frame_starts_playout_after_prefill_ticks() {
        let mut buf = buffer();
        buf.push(frame(7), Instant::now());
        assert!(buf.pop().is_none());
        assert!(buf.pop().is_none());
        assert_eq!(buf.pop().map(|p| p.sequence()), Some(7));
    }

    #[test]
    fn silent_stream_goes_idle_after_bounded_concealment() {
        let config = JitterConfig {
            max_concealed_run: 4,
            prefill_frames: 1,
            ..JitterConfig::default()
        };
        let mut buf = JitterBuffer::new(config);
        buf.push(frame(0), Instant::now());
        let out = drain(&mut buf, 10);
        assert_eq!(out.len(), 5); // one frame, four concealments
        assert!(buf.is_idle());
        assert!(buf.pop().is_none());
    }

    #[test]
    fn reset_forgets_position_but_keeps_stats() {
        let mut buf = buffer();
        let now = Instant::now();
        for seq in 0u16..4 {
            buf.push(frame(seq), now);
        }
        buf.pop();
        buf.reset();
        assert!(buf.is_idle());
        assert_eq!(buf.stats().received, 4);
        assert_eq!(buf.push(frame(2), now), PushOutcome::Buffered);
    }
}

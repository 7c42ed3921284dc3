//! Audio frame definitions.
//!
//! The voice transport carries 48 kHz stereo audio in fixed 20 ms frames.
//! Frames are tagged with an RTP-style 16-bit sequence number (wrapping) and
//! a 32-bit sample timestamp that advances by [`SAMPLES_PER_CHANNEL`] per
//! frame. Both encoded and decoded frames are immutable once produced.

use crate::UserId;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Transport sample rate in Hz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Interleaved channel count of transport PCM.
pub const CHANNELS: usize = 2;

/// Duration of one frame in milliseconds.
pub const FRAME_DURATION_MS: u64 = 20;

/// Duration of one frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_DURATION_MS);

/// Samples per channel in one frame (960 at 48 kHz).
pub const SAMPLES_PER_CHANNEL: usize = (SAMPLE_RATE as usize / 1000) * FRAME_DURATION_MS as usize;

/// Interleaved samples in one decoded frame.
pub const SAMPLES_PER_FRAME: usize = SAMPLES_PER_CHANNEL * CHANNELS;

/// An encoded (wire-format) audio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    sequence: u16,
    timestamp: u32,
    payload: Bytes,
}

impl EncodedFrame {
    pub fn new(sequence: u16, timestamp: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Opaque codec payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Returned when a decoded frame does not hold exactly one frame of samples.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid PCM frame length: expected {expected} samples, got {actual}")]
pub struct FrameLengthError {
    pub expected: usize,
    pub actual: usize,
}

/// A decoded frame of interleaved 16-bit PCM.
///
/// Always holds exactly [`SAMPLES_PER_FRAME`] samples. The sample buffer is
/// shared, so clones are cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    sequence: u16,
    timestamp: u32,
    samples: Arc<[i16]>,
    synthetic: bool,
}

impl PcmFrame {
    /// Builds a frame from decoded samples.
    ///
    /// # Errors
    ///
    /// Returns [`FrameLengthError`] if `samples` is not exactly one frame long.
    pub fn new(sequence: u16, timestamp: u32, samples: Vec<i16>) -> Result<Self, FrameLengthError> {
        if samples.len() != SAMPLES_PER_FRAME {
            return Err(FrameLengthError {
                expected: SAMPLES_PER_FRAME,
                actual: samples.len(),
            });
        }
        Ok(Self {
            sequence,
            timestamp,
            samples: samples.into(),
            synthetic: false,
        })
    }

    /// A synthetic all-zero frame used for loss concealment.
    pub fn silence(sequence: u16, timestamp: u32) -> Self {
        Self {
            sequence,
            timestamp,
            samples: vec![0i16; SAMPLES_PER_FRAME].into(),
            synthetic: true,
        }
    }

    /// Moves the frame to another position on a playout clock, sharing the
    /// sample buffer.
    pub fn restamp(mut self, sequence: u16, timestamp: u32) -> Self {
        self.sequence = sequence;
        self.timestamp = timestamp;
        self
    }

    /// Marks a decoder-generated frame (packet-loss concealment) as synthetic.
    pub fn into_synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Whether the frame was produced by concealment rather than decoded
    /// from a received packet.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn duration(&self) -> Duration {
        FRAME_DURATION
    }
}

/// An encoded frame received from the transport, tagged with its speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub user: UserId,
    pub frame: EncodedFrame,
}

impl InboundPacket {
    pub fn new(user: impl Into<UserId>, frame: EncodedFrame) -> Self {
        Self {
            user: user.into(),
            frame,
        }
    }
}

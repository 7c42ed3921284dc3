//! Frame-level audio processing for the Parley voice pipeline.
//!
//! Everything here is synchronous and runs on the session's 20 ms audio
//! tick; nothing blocks on I/O.
//!
//! - [`codec`]: transcoding between wire frames and linear PCM
//! - [`jitter`]: reordering, pacing and loss concealment of inbound frames
//! - [`vad`]: speech/silence classification and utterance boundaries
//! - [`pcm`]: downmixing, resampling and WAV packaging

pub mod codec;
pub mod jitter;
pub mod pcm;
pub mod vad;

pub use codec::{CodecContext, CodecError, CodecKind, FrameDecoder, FrameEncoder};
pub use jitter::{JitterBuffer, JitterBufferEntry, JitterConfig, JitterStats, Playout, PushOutcome};
pub use vad::{Activity, Classification, GateConfig, GateEvent, VoiceActivityGate};

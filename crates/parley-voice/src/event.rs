//! Session events broadcast to observers.

use crate::error::PipelineError;
use crate::session::{SessionState, StopReason};
use parley_types::{GuildId, UserId};

/// Default capacity for the session event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something observable happened in a guild's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        guild: GuildId,
        from: SessionState,
        to: SessionState,
    },
    Transcript {
        guild: GuildId,
        speaker: Option<UserId>,
        text: String,
        confidence: f32,
        retries: u32,
    },
    Reply {
        guild: GuildId,
        text: String,
        timed_out: bool,
    },
    Spoken {
        guild: GuildId,
        chunks: usize,
        /// Retries summed over all chunks.
        retries: u32,
    },
    Error {
        guild: GuildId,
        error: PipelineError,
        consecutive: u32,
    },
    Stopped {
        guild: GuildId,
        reason: StopReason,
    },
}

impl SessionEvent {
    pub fn guild(&self) -> &GuildId {
        match self {
            Self::StateChanged { guild, .. }
            | Self::Transcript { guild, .. }
            | Self::Reply { guild, .. }
            | Self::Spoken { guild, .. }
            | Self::Error { guild, .. }
            | Self::Stopped { guild, .. } => guild,
        }
    }
}

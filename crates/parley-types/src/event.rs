//! Gateway event payloads consumed by the voice pipeline.
//!
//! The chat gateway emits many event kinds; the pipeline only reacts to the
//! three below, each carrying only the fields the session layer needs.

use crate::{ChannelId, GuildId, UserId};
use serde::{Deserialize, Serialize};

/// Structured gateway events relevant to voice sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEvent {
    /// A user joined, left or moved between voice channels.
    VoiceStateChanged {
        guild: GuildId,
        user: UserId,
        /// The channel the user is now in, `None` if they left voice.
        channel: Option<ChannelId>,
    },

    /// A channel was deleted.
    ChannelDeleted { guild: GuildId, channel: ChannelId },

    /// The guild became unavailable or the bot was removed from it.
    GuildDeleted { guild: GuildId },
}

impl GatewayEvent {
    /// The guild this event belongs to.
    pub fn guild(&self) -> &GuildId {
        match self {
            Self::VoiceStateChanged { guild, .. }
            | Self::ChannelDeleted { guild, .. }
            | Self::GuildDeleted { guild } => guild,
        }
    }

    /// The event type string (matches the serialized `event` tag).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::VoiceStateChanged { .. } => "VOICE_STATE_CHANGED",
            Self::ChannelDeleted { .. } => "CHANNEL_DELETED",
            Self::GuildDeleted { .. } => "GUILD_DELETED",
        }
    }
}

//! Shared types and constants for the Parley voice pipeline.
//!
//! This crate provides the foundational types used across all Parley crates:
//! guild, channel and user identifiers, the fixed 20 ms audio frame format,
//! gateway event payloads, and speech profiles.
//!
//! No crate in the workspace depends on anything *except* `parley-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod audio;
pub mod event;
pub mod voice;

pub use audio::{
    EncodedFrame, FrameLengthError, InboundPacket, PcmFrame, CHANNELS, FRAME_DURATION,
    FRAME_DURATION_MS, SAMPLES_PER_CHANNEL, SAMPLES_PER_FRAME, SAMPLE_RATE,
};
pub use event::GatewayEvent;
pub use voice::SpeechProfile;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a guild (a community with its own voice channels).
    ///
    /// At most one voice session exists per guild.
    GuildId
);

string_id!(
    /// Identifier of a voice or text channel inside a guild.
    ChannelId
);

string_id!(
    /// Identifier of a user speaking in, or present in, a voice channel.
    UserId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_their_raw_value() {
        assert_eq!(GuildId::from("guild1").to_string(), "guild1");
        assert_eq!(ChannelId::from(42u64).as_str(), "42");
        assert_eq!(UserId::new(String::from("u-7")).as_str(), "u-7");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&GuildId::from("g")).unwrap();
        assert_eq!(json, "\"g\"");
        let back: GuildId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, GuildId::from("g"));
    }
}

//! Per-guild session state machine.
//!
//! `GuildVoiceSession` holds the lifecycle state and bookkeeping of one
//! guild's pipeline. It is owned by that session's worker and only changes
//! through the methods below, which reject transitions the lifecycle does not
//! allow.

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use parley_types::{ChannelId, GuildId, UserId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle state of a guild's voice pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Off,
    Connecting,
    Listening,
    Recognizing,
    Routing,
    Synthesizing,
    Playing,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Recognizing => "recognizing",
            Self::Routing => "routing",
            Self::Synthesizing => "synthesizing",
            Self::Playing => "playing",
            Self::Error => "error",
        }
    }

    /// States in which a voice turn is being processed.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Recognizing | Self::Routing | Self::Synthesizing | Self::Playing
        )
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        if to == Off {
            return *self != Off;
        }
        if to == Error {
            return !matches!(self, Off | Error);
        }
        matches!(
            (self, to),
            (Off, Connecting)
                | (Connecting, Listening)
                | (Listening, Recognizing)
                | (Listening, Routing)
                | (Recognizing, Routing)
                | (Recognizing, Listening)
                | (Routing, Synthesizing)
                | (Routing, Listening)
                | (Synthesizing, Playing)
                | (Synthesizing, Listening)
                | (Playing, Listening)
                | (Error, Listening)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned for a transition the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// What the session does after recording an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Expected condition; nothing was counted.
    Ignored,
    /// The session is in `Error` and must be reset back to `Listening`.
    Reset { consecutive: u32 },
    /// The ceiling was exceeded and the session is now `Off`.
    ForcedOff { consecutive: u32 },
}

/// Why a session reached `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    IdleTimeout,
    ChannelEmpty,
    ChannelDeleted,
    GuildDeleted,
    Disconnected,
    ConnectFailed,
    ErrorCeiling,
}

/// Read-only view of a session for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub guild: GuildId,
    pub channel: Option<ChannelId>,
    pub state: SessionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub present_users: Vec<UserId>,
    pub speaker: Option<UserId>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

/// One guild's voice session.
#[derive(Debug)]
pub struct GuildVoiceSession {
    id: Uuid,
    guild: GuildId,
    channel: Option<ChannelId>,
    state: SessionState,
    connected_at: Option<DateTime<Utc>>,
    present: BTreeSet<UserId>,
    speaker: Option<UserId>,
    last_activity: Instant,
    empty_since: Option<Instant>,
    consecutive_errors: u32,
    last_error: Option<String>,
    error_ceiling: u32,
}

impl GuildVoiceSession {
    pub fn new(guild: GuildId, channel: ChannelId, error_ceiling: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            guild,
            channel: Some(channel),
            state: SessionState::Off,
            connected_at: None,
            present: BTreeSet::new(),
            speaker: None,
            last_activity: Instant::now(),
            empty_since: None,
            consecutive_errors: 0,
            last_error: None,
            error_ceiling,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn guild(&self) -> &GuildId {
        &self.guild
    }

    pub fn channel(&self) -> Option<&ChannelId> {
        self.channel.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn speaker(&self) -> Option<&UserId> {
        self.speaker.as_ref()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn empty_since(&self) -> Option<Instant> {
        self.empty_since
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(guild = %self.guild, %from, %to, "rejected session transition");
            return Err(InvalidTransition { from, to });
        }
        self.state = to;
        if to == SessionState::Listening && from == SessionState::Connecting {
            self.connected_at = Some(Utc::now());
        }
        if to == SessionState::Off {
            self.speaker = None;
        }
        info!(guild = %self.guild, session = %self.id, %from, %to, "session state changed");
        Ok(from)
    }

    /// Counts an error and moves to `Error`, or to `Off` past the ceiling.
    ///
    /// Disconnects are not counted. After `Reset` the caller clears its
    /// buffers and calls [`Self::recover`].
    pub fn record_error(&mut self, error: &PipelineError) -> ErrorOutcome {
        if !error.counts_against_session() {
            return ErrorOutcome::Ignored;
        }
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());
        let consecutive = self.consecutive_errors;
        warn!(
            guild = %self.guild,
            kind = %error.kind,
            phase = %error.phase,
            consecutive,
            ceiling = self.error_ceiling,
            "pipeline error"
        );
        if self.state != SessionState::Error {
            // Every live state may enter Error; Off cannot.
            let _ = self.transition(SessionState::Error);
        }
        if consecutive > self.error_ceiling {
            let _ = self.transition(SessionState::Off);
            return ErrorOutcome::ForcedOff { consecutive };
        }
        ErrorOutcome::Reset { consecutive }
    }

    /// Leaves `Error` for `Listening` once buffers have been cleared.
    pub fn recover(&mut self) -> Result<SessionState, InvalidTransition> {
        self.transition(SessionState::Listening)
    }

    /// A turn completed; the consecutive-error run is broken.
    pub fn record_success(&mut self) {
        if self.consecutive_errors > 0 {
            info!(guild = %self.guild, cleared = self.consecutive_errors, "error run cleared");
        }
        self.consecutive_errors = 0;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Grants the floor to `user` if it is free. Returns whether `user` holds it.
    pub fn claim_floor(&mut self, user: &UserId) -> bool {
        match &self.speaker {
            Some(current) => current == user,
            None => {
                self.speaker = Some(user.clone());
                true
            }
        }
    }

    pub fn release_floor(&mut self) -> Option<UserId> {
        self.speaker.take()
    }

    /// Records that `user` is in `channel` (or left voice when `None`).
    pub fn update_presence(&mut self, user: &UserId, channel: Option<&ChannelId>, now: Instant) {
        let here = channel.is_some() && channel == self.channel.as_ref();
        if here {
            self.present.insert(user.clone());
            self.empty_since = None;
        } else if self.present.remove(user) && self.present.is_empty() {
            self.empty_since = Some(now);
        }
    }

    /// The bot was moved to another channel of the same guild. Presence is
    /// rebuilt from later voice-state updates.
    pub fn move_to(&mut self, channel: ChannelId) {
        self.channel = Some(channel);
        self.present.clear();
        self.speaker = None;
        self.empty_since = None;
    }

    /// Marks a user present because audio arrived from them.
    pub fn saw_user(&mut self, user: &UserId) {
        if !self.present.contains(user) {
            self.present.insert(user.clone());
        }
        self.empty_since = None;
    }

    pub fn present_users(&self) -> impl Iterator<Item = &UserId> {
        self.present.iter()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            guild: self.guild.clone(),
            channel: self.channel.clone(),
            state: self.state,
            connected_at: self.connected_at,
            present_users: self.present.iter().cloned().collect(),
            speaker: self.speaker.clone(),
            consecutive_errors: self.consecutive_errors,
            last_error: self.last_error.clone(),
        }
    }
}

//! Registry of per-guild voice sessions.
//!
//! The manager is the public face of the pipeline. It maps each guild to at
//! most one running session, forwards inbound audio and gateway events to the
//! owning worker, and answers text questions, through the session when one is
//! running or straight through the router otherwise.

use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, Phase};
use crate::event::{SessionEvent, DEFAULT_EVENT_CAPACITY};
use crate::router::CommandRouter;
use crate::session::{SessionSnapshot, StopReason};
use crate::worker::{spawn_session, Command, Providers, SessionHandle};
use parley_types::{ChannelId, GatewayEvent, GuildId, InboundPacket};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Cheap, cloneable entry point for one guild's inbound audio.
///
/// Hand one to the transport's receive loop; delivery never blocks.
#[derive(Debug, Clone)]
pub struct AudioSink {
    guild: GuildId,
    tx: mpsc::Sender<InboundPacket>,
}

impl AudioSink {
    pub fn guild(&self) -> &GuildId {
        &self.guild
    }

    /// Queues a packet for the session. Returns `false` if it was dropped
    /// because the session is saturated or gone.
    pub fn deliver(&self, packet: InboundPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(guild = %self.guild, "inbound queue full, packet dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Owns every guild's voice session.
pub struct SessionManager {
    config: Arc<PipelineConfig>,
    providers: Providers,
    router: CommandRouter,
    sessions: RwLock<HashMap<GuildId, SessionHandle>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager after validating `config`.
    pub fn new(config: PipelineConfig, providers: Providers) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = CommandRouter::new(Arc::clone(&providers.agent), config.routing.clone());
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Ok(Self {
            config: Arc::new(config),
            providers,
            router,
            sessions: RwLock::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Subscribes to events from every session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Joins `channel` and starts listening in `guild`.
    ///
    /// If the guild already has a live session this is a no-op that returns
    /// its current snapshot, even when `channel` differs.
    pub async fn start_listening(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<SessionSnapshot, PipelineError> {
        let connected = {
            let mut sessions = self.sessions.write().await;
            if let Some(handle) = sessions.get(&guild) {
                if handle.is_alive() {
                    debug!(guild = %guild, "session already active");
                    return Ok(handle.snapshot());
                }
            }
            let (handle, connected) = spawn_session(
                guild.clone(),
                channel.clone(),
                Arc::clone(&self.config),
                self.providers.clone(),
                self.events.clone(),
                self.cancel.child_token(),
            )?;
            sessions.insert(guild.clone(), handle);
            connected
        };

        info!(guild = %guild, channel = %channel, "starting voice session");
        match connected.await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(err)) => {
                self.remove_finished(&guild).await;
                Err(err)
            }
            Err(_) => {
                self.remove_finished(&guild).await;
                Err(PipelineError::disconnected(&guild, Phase::Connect))
            }
        }
    }

    /// Stops the guild's session. Returns `false` if none was running.
    ///
    /// Returns once the session has cancelled its work, stopped playback and
    /// left the channel.
    pub async fn stop_listening(&self, guild: &GuildId) -> bool {
        let handle = self.sessions.write().await.remove(guild);
        match handle {
            Some(handle) => {
                let was_alive = handle.is_alive();
                stop_handle(guild, handle, StopReason::Requested).await;
                was_alive
            }
            None => false,
        }
    }

    /// Sends `text` to the agent on behalf of `guild` and returns the reply.
    ///
    /// With a live session the question goes through it (and the answer may
    /// be spoken); otherwise the agent is called directly.
    pub async fn ask_question(&self, guild: &GuildId, text: &str) -> Result<String, PipelineError> {
        let commands = {
            let sessions = self.sessions.read().await;
            sessions
                .get(guild)
                .filter(|handle| handle.is_alive())
                .map(|handle| handle.commands.clone())
        };

        if let Some(commands) = commands {
            let (reply, answer) = oneshot::channel();
            let command = Command::Ask {
                text: text.to_string(),
                reply,
            };
            if commands.send(command).await.is_ok() {
                return match answer.await {
                    Ok(outcome) => outcome.map(|o| o.text),
                    Err(_) => Err(PipelineError::disconnected(guild, Phase::Routing)),
                };
            }
        }

        self.router.route(guild, text).await.map(|o| o.text)
    }

    /// Delivers one inbound packet to the guild's session.
    ///
    /// Never blocks. Returns `false` if the packet was dropped.
    pub async fn deliver_audio(&self, guild: &GuildId, packet: InboundPacket) -> bool {
        match self.audio_sink(guild).await {
            Some(sink) => sink.deliver(packet),
            None => false,
        }
    }

    /// A reusable sink for the guild's inbound audio, if a session exists.
    pub async fn audio_sink(&self, guild: &GuildId) -> Option<AudioSink> {
        let sessions = self.sessions.read().await;
        sessions.get(guild).map(|handle| AudioSink {
            guild: guild.clone(),
            tx: handle.inbound.clone(),
        })
    }

    /// Applies a gateway event to the affected session, if any.
    pub async fn handle_gateway_event(&self, event: GatewayEvent) {
        let guild = event.guild().clone();
        if let GatewayEvent::GuildDeleted { .. } = event {
            if let Some(handle) = self.sessions.write().await.remove(&guild) {
                stop_handle(&guild, handle, StopReason::GuildDeleted).await;
            }
            return;
        }

        let commands = {
            let sessions = self.sessions.read().await;
            sessions.get(&guild).map(|handle| handle.commands.clone())
        };
        match commands {
            Some(commands) => {
                if commands.send(Command::Gateway(event)).await.is_err() {
                    trace!(guild = %guild, "gateway event for a finished session");
                }
            }
            None => trace!(guild = %guild, event = event.event_type(), "gateway event ignored"),
        }
    }

    /// The guild's session as last published, including stopped sessions
    /// until they are replaced.
    pub async fn snapshot(&self, guild: &GuildId) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions.get(guild).map(SessionHandle::snapshot)
    }

    /// Guilds with a live session.
    pub async fn active_guilds(&self) -> Vec<GuildId> {
        let sessions = self.sessions.read().await;
        let mut guilds: Vec<GuildId> = sessions
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(guild, _)| guild.clone())
            .collect();
        guilds.sort();
        guilds
    }

    /// Stops every session and waits for them to leave their channels.
    pub async fn shutdown(&self) {
        let handles: Vec<(GuildId, SessionHandle)> =
            self.sessions.write().await.drain().collect();
        info!(sessions = handles.len(), "shutting down voice sessions");
        for (guild, handle) in handles {
            stop_handle(&guild, handle, StopReason::Requested).await;
        }
        self.cancel.cancel();
    }

    async fn remove_finished(&self, guild: &GuildId) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(guild).is_some_and(|handle| !handle.is_alive()) {
            sessions.remove(guild);
        }
    }
}

async fn stop_handle(guild: &GuildId, handle: SessionHandle, reason: StopReason) {
    let (done, stopped) = oneshot::channel();
    let accepted = handle
        .commands
        .send(Command::Stop { reason, done })
        .await
        .is_ok();
    if accepted {
        // The worker drops `done` without answering only if it already exited.
        let _ = stopped.await;
    } else {
        handle.cancel.cancel();
    }
    if let Err(e) = handle.task.await {
        warn!(guild = %guild, error = %e, "session task ended abnormally");
    }
}

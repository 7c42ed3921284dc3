//! Transcript routing to the agent backend.

use crate::config::RoutingConfig;
use crate::error::{AgentError, PipelineError, PipelineErrorKind, Phase};
use crate::provider::AgentBackend;
use parley_types::GuildId;
use std::sync::Arc;
use tracing::{info, warn};

/// The agent's answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub text: String,
    /// The agent missed its deadline and `text` is the configured apology.
    pub timed_out: bool,
}

/// Dispatches transcripts to the agent under a deadline.
///
/// The agent call is never retried: a repeated request could duplicate its
/// side effects. A missed deadline yields the apology text instead of an
/// error, so the turn still completes.
#[derive(Clone)]
pub struct CommandRouter {
    agent: Arc<dyn AgentBackend>,
    config: RoutingConfig,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CommandRouter {
    pub fn new(agent: Arc<dyn AgentBackend>, config: RoutingConfig) -> Self {
        Self { agent, config }
    }

    pub async fn route(&self, guild: &GuildId, transcript: &str) -> Result<RouteOutcome, PipelineError> {
        let deadline = self.config.deadline();
        match tokio::time::timeout(deadline, self.agent.respond(guild, transcript)).await {
            Ok(Ok(text)) => {
                info!(guild = %guild, chars = text.chars().count(), "agent replied");
                Ok(RouteOutcome {
                    text,
                    timed_out: false,
                })
            }
            Ok(Err(AgentError::Unavailable(detail))) => Err(PipelineError::new(
                PipelineErrorKind::ProviderUnavailable,
                guild.clone(),
                Phase::Routing,
                detail,
            )),
            Ok(Err(AgentError::Rejected(detail))) => Err(PipelineError::new(
                PipelineErrorKind::ProviderRejected,
                guild.clone(),
                Phase::Routing,
                detail,
            )),
            Err(_) => {
                warn!(
                    guild = %guild,
                    kind = %PipelineErrorKind::AgentTimeout,
                    deadline_ms = deadline.as_millis() as u64,
                    "agent missed deadline, replying with apology"
                );
                Ok(RouteOutcome {
                    text: self.config.apology.clone(),
                    timed_out: true,
                })
            }
        }
    }
}

//! Tracing setup for hosts embedding the pipeline.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber configured from `config`.
///
/// An unparsable level falls back to `info`. Returns an error if a global
/// subscriber is already installed, which hosts that configure tracing
/// themselves can ignore.
pub fn init_tracing(
    config: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_reported_not_fatal() {
        let config = LoggingConfig {
            level: "not a [valid filter".to_string(),
            json: false,
        };
        // The first call may lose to another test's subscriber; the second never wins.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}

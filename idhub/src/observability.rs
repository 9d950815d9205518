//! Structured logging bootstrap

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Install a JSON `tracing` subscriber filtered by `service.log_level`
///
/// An unparsable level falls back to `info`. If a global subscriber is
/// already installed (tests, embedding binaries) it is left in place.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            service = %config.service.name,
            environment = %config.service.environment,
            "Tracing initialized"
        );
    } else {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = Config::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }

    #[test]
    fn test_bad_level_falls_back() {
        let mut config = Config::default();
        config.service.log_level = "not a [level".to_string();
        assert!(init_tracing(&config).is_ok());
    }
}

//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level so individual
//! modules can be turned up without editing the config file:
//!
//! ```text
//! RUST_LOG=remote_daq::server=trace,remote_daq::client=debug remote_daq serve
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber. Returns an error if one is already set.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_target(true);

    let result = if config.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_falls_back_to_configured_level() {
        let config = LoggingConfig {
            level: "warn".into(),
            json: false,
        };
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(filter(&config).to_string(), "warn");
        }
    }
}

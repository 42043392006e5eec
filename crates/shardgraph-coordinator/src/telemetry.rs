//! Tracing subscriber setup.

use shardgraph_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, else from the configured level. An unparsable
/// level falls back to `info`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. Returns `false` if one was already
/// installed.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&logging.level))
        .with_target(true);

    let result = if logging.format == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let logging = LoggingConfig {
            level: "shardgraph_coordinator=debug,warn".to_string(),
            format: "pretty".to_string(),
        };
        init_tracing(&logging);
        assert!(!init_tracing(&logging));
    }
}

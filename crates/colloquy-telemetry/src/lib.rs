//! Logging initialization.
//!
//! One fmt layer with an `EnvFilter`: `RUST_LOG` wins when set, otherwise
//! the configured default level applies to the workspace crates and `warn`
//! to everything else.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub default_level: String,
    /// Compact single-line output instead of the default field layout.
    pub compact: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: "info".into(),
            compact: false,
        }
    }
}

/// Keeps telemetry alive for the process lifetime.
pub struct TelemetryGuard {
    _private: (),
}

pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,colloquy={level},colloquy_core={level},colloquy_llm={level},\
             colloquy_store={level},colloquy_engine={level},colloquy_server={level}",
            level = config.default_level
        ))
    });

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry().with(filter);

    if config.compact {
        registry.with(fmt_layer.compact()).init();
    } else {
        registry.with(fmt_layer).init();
    }

    TelemetryGuard { _private: () }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_level, "info");
        assert!(!config.compact);
    }
}

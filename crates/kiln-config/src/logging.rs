//! Logging bootstrap for kiln components.
//!
//! All crates log through `tracing`; this module wires up a subscriber
//! with an `EnvFilter` so `RUST_LOG` keeps working in every binary that
//! embeds the engine.

/// Component identifiers used as the `component` field on log events
pub struct Component;

impl Component {
    pub const ENGINE: &'static str = "ENGINE";
    pub const CACHE: &'static str = "CACHE";
    pub const MONITOR: &'static str = "MONITOR";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` wins when set.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_constants() {
        assert_eq!(Component::ENGINE, "ENGINE");
        assert_eq!(Component::CACHE, "CACHE");
        assert_eq!(Component::MONITOR, "MONITOR");
    }
}

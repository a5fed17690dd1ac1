mod recent;

pub use recent::{RecentLog, RecentLogLayer, RecentRecord};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "queenlive_signaling" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// How many warn+ records to keep in memory. Zero disables the buffer.
    pub recent_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            recent_capacity: 64,
        }
    }
}

impl TelemetryConfig {
    /// Build the filter directive string, e.g. `info,queenlive_session=debug`.
    pub fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Keeps telemetry state alive for the process lifetime.
pub struct TelemetryGuard {
    recent: Option<Arc<RecentLog>>,
}

impl TelemetryGuard {
    /// Recently recorded warnings and errors, newest last.
    pub fn recent(&self) -> Option<&RecentLog> {
        self.recent.as_deref()
    }
}

/// Parse a level name leniently, falling back to INFO.
pub fn parse_level(name: &str) -> Level {
    name.trim().parse::<Level>().unwrap_or(Level::INFO)
}

/// Initialize the telemetry subsystem. Call once at startup; a second call
/// keeps the first subscriber.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    let recent = (config.recent_capacity > 0).then(|| Arc::new(RecentLog::new(config.recent_capacity)));
    let recent_layer = recent.clone().map(RecentLogLayer::new);

    if tracing_subscriber::registry()
        .with(fmt_layer)
        .with(recent_layer)
        .try_init()
        .is_err()
    {
        eprintln!("queenlive-telemetry: subscriber already installed");
    }

    TelemetryGuard { recent }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_includes_modules() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("queenlive_session".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "warn,queenlive_session=debug");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn zero_capacity_disables_recent_buffer() {
        let guard = init_telemetry(TelemetryConfig {
            recent_capacity: 0,
            ..Default::default()
        });
        assert!(guard.recent().is_none());
    }
}

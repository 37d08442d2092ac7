//! Structured logging via tracing-subscriber
//!
//! `ROOMCALL_LOG` takes precedence over the configured level and accepts any
//! `EnvFilter` directive, e.g. `roomcall_signaling=debug,tower_http=info`.

use crate::config::LoggingSettings;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "ROOMCALL_LOG";

/// Install the global subscriber
pub fn init(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match settings.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_current_span(true)
                .init();
        }
        _ => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
    }
}

pub fn is_valid_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

pub fn is_valid_format(format: &str) -> bool {
    matches!(format, "text" | "json")
}

//! Opt-in log output for the pooling engine.
//!
//! The pool logs through `tracing` at all times. This module only installs a
//! subscriber for applications that do not bring their own, driven by:
//!
//! - `PRAX_POOL_DEBUG=true|1|yes` - debug-level output
//! - `PRAX_POOL_LOG_LEVEL=trace|debug|info|warn|error` - explicit level
//! - `PRAX_POOL_LOG_FORMAT=json|pretty|compact` - output format (default: json)
//!
//! ```rust,no_run
//! prax_pool::logging::init();
//! ```
//!
//! Installing the subscriber needs the `tracing-subscriber` feature; without
//! it `init` only records that logging was requested.

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

const DEBUG_VAR: &str = "PRAX_POOL_DEBUG";
const LEVEL_VAR: &str = "PRAX_POOL_LOG_LEVEL";
const FORMAT_VAR: &str = "PRAX_POOL_LOG_FORMAT";

/// Whether `PRAX_POOL_DEBUG` asks for debug output.
pub fn is_debug_enabled() -> bool {
    env::var(DEBUG_VAR).is_ok_and(|v| parse_flag(&v))
}

/// Level from `PRAX_POOL_LOG_LEVEL`, falling back to `debug` when
/// `PRAX_POOL_DEBUG` is set and `warn` otherwise.
pub fn log_level() -> &'static str {
    resolve_level(env::var(LEVEL_VAR).ok().as_deref(), is_debug_enabled())
}

/// Format from `PRAX_POOL_LOG_FORMAT`.
pub fn log_format() -> &'static str {
    resolve_format(env::var(FORMAT_VAR).ok().as_deref())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn resolve_level(requested: Option<&str>, debug: bool) -> &'static str {
    let fallback = if debug { "debug" } else { "warn" };
    match requested.map(str::to_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") => "warn",
        Some("error") => "error",
        _ => fallback,
    }
}

fn resolve_format(requested: Option<&str>) -> &'static str {
    match requested.map(str::to_lowercase).as_deref() {
        Some("pretty") => "pretty",
        Some("compact") => "compact",
        _ => "json",
    }
}

/// Install the subscriber if the environment asks for logging. Later calls
/// are no-ops.
pub fn init() {
    if !is_debug_enabled() && env::var(LEVEL_VAR).is_err() {
        return;
    }
    install(log_level(), log_format());
}

/// Install the subscriber at `level`, ignoring the environment's level.
pub fn init_with_level(level: &str) {
    install(resolve_level(Some(level), false), log_format());
}

fn install(level: &'static str, format: &'static str) {
    INIT.call_once(|| {
        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let filter = EnvFilter::try_new(format!("prax_pool={}", level))
                .unwrap_or_else(|_| EnvFilter::new("warn"));
            let registry = tracing_subscriber::registry().with(filter);
            let installed = match format {
                "json" => registry.with(fmt::layer().json()).try_init(),
                "compact" => registry.with(fmt::layer().compact()).try_init(),
                _ => registry.with(fmt::layer().pretty()).try_init(),
            };
            if installed.is_ok() {
                tracing::info!(level, format, "prax-pool logging initialized");
            }
        }

        #[cfg(not(feature = "tracing-subscriber"))]
        {
            let _ = (level, format);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("off"));
    }

    #[test]
    fn test_level_resolution() {
        assert_eq!(resolve_level(None, false), "warn");
        assert_eq!(resolve_level(None, true), "debug");
        assert_eq!(resolve_level(Some("TRACE"), false), "trace");
        assert_eq!(resolve_level(Some("verbose"), true), "debug");
    }

    #[test]
    fn test_format_resolution() {
        assert_eq!(resolve_format(None), "json");
        assert_eq!(resolve_format(Some("Pretty")), "pretty");
        assert_eq!(resolve_format(Some("compact")), "compact");
        assert_eq!(resolve_format(Some("xml")), "json");
    }
}

use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::LogConfig;

/// Build the filter: a non-empty `RUST_LOG` wins over the configured level.
fn build_filter(level: &str, rust_log: Option<String>) -> Result<EnvFilter> {
    let directives = rust_log
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| level.to_string());
    EnvFilter::try_new(&directives).wrap_err_with(|| format!("Invalid log filter: {directives}"))
}

/// Initialize the global subscriber, JSON or human readable.
pub fn init_tracing(level: &str, json_format: bool) -> Result<()> {
    let filter = build_filter(level, std::env::var(EnvFilter::DEFAULT_ENV).ok())?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(filter)
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    } else {
        Registry::default()
            .with(filter)
            .with(fmt_layer.pretty())
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    }

    tracing::debug!(level, json = json_format, "Ruleway logging initialized");
    Ok(())
}

pub fn init_tracing_from_config(log: &LogConfig) -> Result<()> {
    init_tracing(&log.level, log.json)
}

/// Span wrapping one router rebuild.
pub fn create_rebuild_span(routes: usize) -> tracing::Span {
    tracing::info_span!("router_rebuild", routes, installed = tracing::field::Empty)
}

/// Span wrapping one proxied request.
pub fn create_backend_span(backend: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "backend_request",
        backend = backend,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_is_used_without_rust_log() {
        let filter = build_filter("debug", None).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_rust_log_overrides_level() {
        let filter = build_filter("info", Some("ruleway=trace".to_string())).unwrap();
        assert_eq!(filter.to_string(), "ruleway=trace");
    }

    #[test]
    fn test_blank_rust_log_is_ignored() {
        let filter = build_filter("warn", Some("  ".to_string())).unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(build_filter("ruleway=loud", None).is_err());
    }
}

//! Metrics helpers for Ruleway.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is embedded;
//! the embedding application installs whichever recorder it wants and the
//! calls below become no-ops when none is installed.
//!
//! Provided metrics:
//! * `ruleway_configuration_applies_total` (counter, `provider`)
//! * `ruleway_messages_dropped_total` (counter, `provider`, `reason`)
//! * `ruleway_provider_failures_total` (counter, `provider`)
//! * `ruleway_routes_installed` (gauge)
//! * `ruleway_route_build_failures_total` (counter, `route`)
//! * `ruleway_backend_requests_total` (counter, `backend`, `method`, `status`)
//! * `ruleway_backend_request_duration_seconds` (histogram, `backend`, `method`)
use std::time::{Duration, Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const RULEWAY_CONFIGURATION_APPLIES_TOTAL: &str = "ruleway_configuration_applies_total";
pub const RULEWAY_MESSAGES_DROPPED_TOTAL: &str = "ruleway_messages_dropped_total";
pub const RULEWAY_PROVIDER_FAILURES_TOTAL: &str = "ruleway_provider_failures_total";
pub const RULEWAY_ROUTES_INSTALLED: &str = "ruleway_routes_installed";
pub const RULEWAY_ROUTE_BUILD_FAILURES_TOTAL: &str = "ruleway_route_build_failures_total";
pub const RULEWAY_BACKEND_REQUESTS_TOTAL: &str = "ruleway_backend_requests_total";
pub const RULEWAY_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "ruleway_backend_request_duration_seconds";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        RULEWAY_CONFIGURATION_APPLIES_TOTAL,
        Unit::Count,
        "Configurations applied by the watcher, by provider."
    );
    describe_counter!(
        RULEWAY_MESSAGES_DROPPED_TOTAL,
        Unit::Count,
        "Provider messages discarded before apply (empty, duplicate, superseded)."
    );
    describe_counter!(
        RULEWAY_PROVIDER_FAILURES_TOTAL,
        Unit::Count,
        "Providers that failed to initialize or stopped with an error."
    );
    describe_gauge!(
        RULEWAY_ROUTES_INSTALLED,
        "Routes installed in the active router."
    );
    describe_counter!(
        RULEWAY_ROUTE_BUILD_FAILURES_TOTAL,
        Unit::Count,
        "Route declarations skipped during a router rebuild."
    );
    describe_counter!(
        RULEWAY_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Requests forwarded to backend services."
    );
    describe_histogram!(
        RULEWAY_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to backend services."
    );
});

pub fn increment_configuration_applies(provider: &str) {
    counter!(RULEWAY_CONFIGURATION_APPLIES_TOTAL, "provider" => provider.to_string()).increment(1);
}

/// Count a message dropped by the watcher. `reason` is one of
/// `empty`, `duplicate` or `superseded`.
pub fn increment_messages_dropped(provider: &str, reason: &'static str) {
    counter!(
        RULEWAY_MESSAGES_DROPPED_TOTAL,
        "provider" => provider.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn increment_provider_failures(provider: &str) {
    counter!(RULEWAY_PROVIDER_FAILURES_TOTAL, "provider" => provider.to_string()).increment(1);
}

pub fn set_routes_installed(count: usize) {
    gauge!(RULEWAY_ROUTES_INSTALLED).set(count as f64);
}

pub fn increment_route_build_failures(route: &str) {
    counter!(RULEWAY_ROUTE_BUILD_FAILURES_TOTAL, "route" => route.to_string()).increment(1);
}

/// Increment total count of proxied backend requests.
pub fn increment_backend_request_total(backend: &str, method: &str, status: u16) {
    counter!(
        RULEWAY_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed backend request duration.
pub fn record_backend_request_duration(backend: &str, method: &str, duration: Duration) {
    histogram!(
        RULEWAY_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper recording a backend request when dropped.
///
/// The status defaults to 502 so an early return still counts as a failure.
pub struct BackendRequestTimer {
    start: Instant,
    backend: String,
    method: String,
    status: u16,
}

impl BackendRequestTimer {
    pub fn new(backend: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
            method: method.to_string(),
            status: 502,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        increment_backend_request_total(&self.backend, &self.method, self.status);
        record_backend_request_duration(&self.backend, &self.method, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Ruleway metrics");
    Lazy::force(&DESCRIPTIONS);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_request_timer_defaults_to_bad_gateway() {
        let mut timer = BackendRequestTimer::new("api@file", "GET");
        assert_eq!(timer.status(), 502);
        timer.set_status(200);
        assert_eq!(timer.status(), 200);
        drop(timer);
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_without_recorder() {
        increment_configuration_applies("file");
        increment_messages_dropped("file", "duplicate");
        increment_provider_failures("http");
        set_routes_installed(3);
        increment_route_build_failures("broken@file");
    }
}

//! Metric names and recording helpers. Only the `metrics` facade is used;
//! installing an exporter is left to the embedding application.

use crate::middleware::builtin::RetryListener;
use hyper::http::request::Parts;
use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const RETRIES_TOTAL: &str = "edgeroute_retries_total";
pub const SERVER_UP: &str = "edgeroute_server_up";
pub const CONFIG_RELOADS_TOTAL: &str = "edgeroute_config_reloads_total";

/// Register descriptions with whatever recorder is installed.
pub fn describe() {
    describe_counter!(RETRIES_TOTAL, "Requests retried by the retry middleware, per service");
    describe_gauge!(SERVER_UP, "Backend server status from health checks (1=up, 0=down)");
    describe_counter!(CONFIG_RELOADS_TOTAL, "Dynamic configurations applied");
}

pub struct Metrics;

impl Metrics {
    #[inline]
    pub fn record_server_status(service: &str, server: &str, up: bool) {
        let labels = [("service", service.to_string()), ("server", server.to_string())];
        gauge!(SERVER_UP, &labels).set(if up { 1.0 } else { 0.0 });
    }

    #[inline]
    pub fn record_config_reload() {
        counter!(CONFIG_RELOADS_TOTAL).increment(1);
    }
}

/// Counts retries per service.
pub struct MetricsRetryListener {
    service: String,
}

impl MetricsRetryListener {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }
}

impl RetryListener for MetricsRetryListener {
    fn retried(&self, _req: &Parts, _attempt: u32) {
        counter!(RETRIES_TOTAL, "service" => self.service.clone()).increment(1);
    }
}

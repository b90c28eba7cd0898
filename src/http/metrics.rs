//! Prometheus metrics for decisions and HTTP traffic.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Label value for an admitted request.
pub const DECISION_ALLOW: &str = "allow";
/// Label value for a rejected request.
pub const DECISION_DENY: &str = "deny";

/// Metrics owned by the HTTP layer, registered in a private registry.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    decisions: IntCounterVec,
    store_errors: IntCounterVec,
    request_duration: HistogramVec,
}

impl Metrics {
    /// Create the collectors and register them.
    ///
    /// # Errors
    /// Returns an error if a collector cannot be registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let decisions = IntCounterVec::new(
            Opts::new("rate_limit_requests_total", "Rate-limit decisions."),
            &["decision"],
        )?;
        let store_errors = IntCounterVec::new(
            Opts::new(
                "rate_limit_store_errors_total",
                "Requests whose decision failed in the shared store.",
            ),
            &["kind"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency."),
            &["path", "method", "status"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            store_errors,
            request_duration,
        })
    }

    /// Count one decided request.
    pub fn record_decision(&self, allowed: bool) {
        let label = if allowed { DECISION_ALLOW } else { DECISION_DENY };
        self.decisions.with_label_values(&[label]).inc();
    }

    /// Count a request that ended without a decision.
    pub fn record_store_error(&self, kind: &str) {
        self.store_errors.with_label_values(&[kind]).inc();
    }

    /// Record how long a request took.
    pub fn observe_request(&self, path: &str, method: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.request_duration
            .with_label_values(&[path, method, status.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Current value of the decision counter for `decision`.
    pub fn decision_count(&self, decision: &str) -> u64 {
        self.decisions.with_label_values(&[decision]).get()
    }

    /// Current value of the store error counter for `kind`.
    pub fn store_error_count(&self, kind: &str) -> u64 {
        self.store_errors.with_label_values(&[kind]).get()
    }

    /// Render every metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions_counted_by_label() {
        let metrics = Metrics::new().unwrap();
        metrics.record_decision(true);
        metrics.record_decision(true);
        metrics.record_decision(false);

        assert_eq!(metrics.decision_count(DECISION_ALLOW), 2);
        assert_eq!(metrics.decision_count(DECISION_DENY), 1);
    }

    #[test]
    fn test_render_contains_metric_names() {
        let metrics = Metrics::new().unwrap();
        metrics.record_decision(true);
        metrics.record_store_error("timeout");
        metrics.observe_request("/healthz", "GET", 200, Duration::from_millis(3));

        let text = metrics.render().unwrap();
        assert!(text.contains("rate_limit_requests_total"));
        assert!(text.contains("rate_limit_store_errors_total"));
        assert!(text.contains("http_request_duration_seconds"));
    }
}

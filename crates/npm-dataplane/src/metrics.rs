//! Prometheus metrics for the dataplane.
//!
//! One [`DataplaneMetrics`] is created per manager and cloned into the
//! backend, so tests can run several managers side by side without sharing
//! counters. Production code only writes these values.

use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramTimer, HistogramVec,
    IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Kind of endpoint ACL request, used as the `operation` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclOperation {
    /// New ACLs appended to an endpoint.
    Create,
    /// Endpoint policy list replaced.
    Update,
}

impl AclOperation {
    fn label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// Prometheus metrics collector for the dataplane
#[derive(Clone)]
pub struct DataplaneMetrics {
    // Gauges
    num_acl_rules: IntGauge,

    // Counters
    errors: Counter,
    get_endpoint_failures: Counter,
    acl_failures: CounterVec,

    // Histograms
    acl_exec_time_seconds: Histogram,
    get_endpoint_latency_seconds: Histogram,
    acl_latency_seconds: HistogramVec,

    registry: Arc<Registry>,
}

impl DataplaneMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let num_acl_rules = IntGauge::new(
            "npm_num_acl_rules",
            "Number of ACL rules currently programmed by this node",
        )?;
        registry.register(Box::new(num_acl_rules.clone()))?;

        let errors = Counter::new(
            "npm_dataplane_errors_total",
            "Total dataplane operations that returned an error",
        )?;
        registry.register(Box::new(errors.clone()))?;

        let get_endpoint_failures = Counter::new(
            "npm_get_endpoint_failures_total",
            "Total failed host endpoint lookups",
        )?;
        registry.register(Box::new(get_endpoint_failures.clone()))?;

        let acl_failures = CounterVec::new(
            Opts::new(
                "npm_acl_failures_total",
                "Total failed endpoint ACL requests by operation",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(acl_failures.clone()))?;

        let acl_exec_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "npm_acl_exec_time_seconds",
                "Time to apply one policy to the dataplane in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(acl_exec_time_seconds.clone()))?;

        let get_endpoint_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "npm_get_endpoint_latency_seconds",
                "Host endpoint lookup latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(get_endpoint_latency_seconds.clone()))?;

        let acl_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "npm_acl_latency_seconds",
                "Endpoint ACL request latency in seconds by operation",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(acl_latency_seconds.clone()))?;

        Ok(Self {
            num_acl_rules,
            errors,
            get_endpoint_failures,
            acl_failures,
            acl_exec_time_seconds,
            get_endpoint_latency_seconds,
            acl_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Reset the active rule gauge to zero
    pub fn reset_num_acl_rules(&self) {
        self.num_acl_rules.set(0);
    }

    /// Add to the active rule gauge
    pub fn inc_num_acl_rules_by(&self, count: usize) {
        self.num_acl_rules.add(count as i64);
    }

    /// Apply a signed change to the active rule gauge
    pub fn adjust_num_acl_rules(&self, delta: i64) {
        self.num_acl_rules.add(delta);
    }

    /// Current value of the active rule gauge
    pub fn num_acl_rules(&self) -> i64 {
        self.num_acl_rules.get()
    }

    /// Record an operation that returned an error
    pub fn record_error(&self) {
        self.errors.inc();
    }

    /// Record a failed host endpoint lookup
    pub fn record_get_endpoint_failure(&self) {
        self.get_endpoint_failures.inc();
    }

    /// Record a failed endpoint ACL request
    pub fn record_acl_failure(&self, operation: AclOperation) {
        self.acl_failures
            .with_label_values(&[operation.label()])
            .inc();
    }

    /// Start the per-policy execution timer
    pub fn start_acl_exec_timer(&self) -> HistogramTimer {
        self.acl_exec_time_seconds.start_timer()
    }

    /// Start the host endpoint lookup timer
    pub fn start_get_endpoint_timer(&self) -> HistogramTimer {
        self.get_endpoint_latency_seconds.start_timer()
    }

    /// Start the endpoint ACL request timer
    pub fn start_acl_timer(&self, operation: AclOperation) -> HistogramTimer {
        self.acl_latency_seconds
            .with_label_values(&[operation.label()])
            .start_timer()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}

impl Default for DataplaneMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create dataplane metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        assert!(DataplaneMetrics::new().is_ok());
    }

    #[test]
    fn test_num_acl_rules_gauge() {
        let metrics = DataplaneMetrics::new().unwrap();
        metrics.inc_num_acl_rules_by(11);
        metrics.inc_num_acl_rules_by(3);
        metrics.adjust_num_acl_rules(-2);
        assert_eq!(metrics.num_acl_rules(), 12);
        assert!(metrics.gather_metrics().contains("npm_num_acl_rules 12"));

        metrics.reset_num_acl_rules();
        assert_eq!(metrics.num_acl_rules(), 0);
    }

    #[test]
    fn test_acl_failures_by_operation() {
        let metrics = DataplaneMetrics::new().unwrap();
        metrics.record_acl_failure(AclOperation::Update);
        let text = metrics.gather_metrics();
        assert!(text.contains("npm_acl_failures_total{operation=\"update\"} 1"));
    }

    #[test]
    fn test_acl_latency_histogram() {
        let metrics = DataplaneMetrics::new().unwrap();
        drop(metrics.start_acl_timer(AclOperation::Create));
        let text = metrics.gather_metrics();
        assert!(text.contains("npm_acl_latency_seconds_bucket"));
        assert!(text.contains("operation=\"create\""));
    }

    #[test]
    fn test_independent_registries() {
        let a = DataplaneMetrics::new().unwrap();
        let b = DataplaneMetrics::new().unwrap();
        a.record_error();
        assert!(a.gather_metrics().contains("npm_dataplane_errors_total 1"));
        assert!(b.gather_metrics().contains("npm_dataplane_errors_total 0"));
    }
}

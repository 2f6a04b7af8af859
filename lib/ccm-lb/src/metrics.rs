//! Reconcile outcome and latency metrics

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Receives one observation per reconciler entry point call
pub trait MetricsSink: Send + Sync {
    /// `outcome` is "success" or an error kind
    fn observe(&self, operation: &str, outcome: &str, elapsed: Duration);
}

/// Discards every observation
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe(&self, _operation: &str, _outcome: &str, _elapsed: Duration) {}
}

/// Prometheus collector for load balancer reconciliation
#[derive(Clone)]
pub struct PrometheusMetrics {
    /// Reconcile calls by operation and outcome
    pub reconcile_total: CounterVec,
    /// Reconcile latency in seconds
    pub reconcile_duration_seconds: HistogramVec,
    pub registry: Arc<Registry>,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Registers the collectors on an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let reconcile_total = CounterVec::new(
            Opts::new("ccm_reconcile_total", "Load balancer reconcile calls"),
            &["operation", "outcome"],
        )?;
        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ccm_reconcile_duration_seconds",
                "Load balancer reconcile latency in seconds",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        Ok(Self {
            reconcile_total,
            reconcile_duration_seconds,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn observe(&self, operation: &str, outcome: &str, elapsed: Duration) {
        self.reconcile_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }
}

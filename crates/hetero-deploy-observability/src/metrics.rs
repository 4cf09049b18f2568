//! Prometheus metrics for deployment, exchange routing, and executor
//! supervision.
//!
//! # Metric Categories
//!
//! - **Queue metrics**: live depth per exchange endpoint
//! - **Redeploy metrics**: decisions made by the abnormal-status
//!   handler, labeled by [`FailureClass`]-style classification
//! - **Latency metrics**: heartbeat round-trip and dynamic-sched
//!   decision latency
//! - **Data-flow metrics**: exceptions reported by executors, by scope
//!
//! # Usage
//!
//! ```rust
//! use hetero_deploy_observability::DeployMetrics;
//!
//! let metrics = DeployMetrics::new().unwrap();
//! metrics.set_queue_depth("root.out", 3);
//! metrics.record_redeploy_decision("not_support_dynamic_sched");
//! metrics.observe_heartbeat_latency(0.012);
//! ```

use crate::error::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

const LATENCY_BUCKETS_SECONDS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Prometheus metrics for one deployer process.
#[derive(Clone)]
pub struct DeployMetrics {
    /// The registry these metrics are bound to.
    pub registry: Registry,

    /// Live queue depth per exchange endpoint name.
    pub queue_depth: IntGaugeVec,

    /// Redeploy/dynamic-sched/abort decisions by classification.
    pub redeploy_decisions_total: IntCounterVec,

    /// Heartbeat round-trip latency, in seconds.
    pub heartbeat_latency_seconds: Histogram,

    /// Dynamic-sched decision latency (time to classify and dispatch
    /// an `AbnormalEvent`), in seconds.
    pub dynamic_sched_decision_seconds: Histogram,

    /// Data-flow exceptions reported by executors, by scope.
    pub data_flow_exceptions_total: IntCounterVec,
}

impl DeployMetrics {
    /// Build a fresh set of metrics bound to a new [`Registry`].
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Build a set of metrics bound to a caller-supplied registry, so
    /// several metric groups can share one `/metrics` endpoint.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Live queue depth per exchange endpoint").namespace("hetero_deploy"),
            &["endpoint"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let redeploy_decisions_total = IntCounterVec::new(
            Opts::new(
                "redeploy_decisions_total",
                "Redeploy/dynamic-sched/abort decisions by classification",
            )
            .namespace("hetero_deploy"),
            &["classification"],
        )?;
        registry.register(Box::new(redeploy_decisions_total.clone()))?;
        for classification in ["not_support_redeploy", "not_support_dynamic_sched", "not_support_default", "dynamic_sched"] {
            let _ = redeploy_decisions_total.with_label_values(&[classification]);
        }

        let heartbeat_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("heartbeat_latency_seconds", "Heartbeat round-trip latency in seconds")
                .namespace("hetero_deploy")
                .buckets(LATENCY_BUCKETS_SECONDS.to_vec()),
        )?;
        registry.register(Box::new(heartbeat_latency_seconds.clone()))?;

        let dynamic_sched_decision_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "dynamic_sched_decision_seconds",
                "Time to classify and dispatch an abnormal-status decision, in seconds",
            )
            .namespace("hetero_deploy")
            .buckets(LATENCY_BUCKETS_SECONDS.to_vec()),
        )?;
        registry.register(Box::new(dynamic_sched_decision_seconds.clone()))?;

        let data_flow_exceptions_total = IntCounterVec::new(
            Opts::new("data_flow_exceptions_total", "Data-flow exceptions reported by executors, by scope").namespace("hetero_deploy"),
            &["scope"],
        )?;
        registry.register(Box::new(data_flow_exceptions_total.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            redeploy_decisions_total,
            heartbeat_latency_seconds,
            dynamic_sched_decision_seconds,
            data_flow_exceptions_total,
        })
    }

    /// Set the current live depth for one endpoint's queue.
    pub fn set_queue_depth(&self, endpoint: &str, depth: i64) {
        self.queue_depth.with_label_values(&[endpoint]).set(depth);
    }

    /// Record one redeploy/dynamic-sched/abort decision.
    pub fn record_redeploy_decision(&self, classification: &str) {
        self.redeploy_decisions_total.with_label_values(&[classification]).inc();
    }

    /// Observe one heartbeat round trip.
    pub fn observe_heartbeat_latency(&self, seconds: f64) {
        self.heartbeat_latency_seconds.observe(seconds);
    }

    /// Observe one dynamic-sched classify-and-dispatch decision.
    pub fn observe_dynamic_sched_decision(&self, seconds: f64) {
        self.dynamic_sched_decision_seconds.observe(seconds);
    }

    /// Record one data-flow exception report.
    pub fn record_data_flow_exception(&self, scope: &str) {
        self.data_flow_exceptions_total.with_label_values(&[scope]).inc();
    }

    /// Encode every metric in this registry as Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer).map_err(|e| crate::error::Error::Metrics(e.to_string()))?)
    }
}

static GLOBAL: OnceLock<DeployMetrics> = OnceLock::new();

/// The process-wide metrics instance, created once on first access.
pub fn global() -> &'static DeployMetrics {
    GLOBAL.get_or_init(|| DeployMetrics::new().expect("default metric registration cannot fail"))
}

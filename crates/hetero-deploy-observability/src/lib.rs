//! Prometheus metrics and structured tracing glue for `hetero-deploy`.
//!
//! This crate trims the corpus's observability stack to what a
//! heterogeneous deployment core actually emits: live queue depth per
//! exchange endpoint, redeploy/dynamic-sched decisions by
//! classification, heartbeat and dynamic-sched decision latency, and
//! data-flow exceptions by scope. The Kafka/WebSocket telemetry relay
//! and cost-tracking modules the corpus also carries are out of scope
//! here (see DESIGN.md).

pub mod config;
pub mod error;
pub mod metrics;

#[cfg(feature = "metrics-server")]
pub mod metrics_server;

pub use config::LoggingConfig;
pub use error::{Error, Result};
pub use metrics::{global, DeployMetrics};

//! Heterogeneous flow model deployment planner, exchange route engine,
//! and executor supervision core.
//!
//! This crate implements the three tightly coupled subsystems described
//! for a distributed model-deployment runtime:
//!
//!  - the deployment planner/router ([`planner`], [`plan`]) that
//!    resolves a [`model::FlowModel`] to device placements and per-node
//!    [`route::FlowRoutePlan`]s;
//!  - the exchange route engine ([`exchange`]) that materializes those
//!    plans into a realized [`exchange::ExchangeRoute`] through a
//!    gateway client, and reroutes around device failure;
//!  - executor supervision ([`subprocess`], [`executor`]) and the
//!    abnormal-status handler ([`abnormal`]) that forks/monitors
//!    per-device executor processes and drives redeployment on
//!    failure.
//!
//! [`deploy_context`] and [`orchestrator`] tie these together into the
//! end-to-end deploy routine; [`runtime`] is the client-side handle
//! (`Feed`/`Fetch`, dynamic scheduling) used once a model is deployed.

pub mod abnormal;
pub mod config;
pub mod constants;
pub mod deploy_context;
pub mod device;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod route;
pub mod runtime;
pub mod subprocess;

pub use error::{Error, Result};

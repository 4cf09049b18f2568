//! Exchange route engine: materializes a [`crate::route::FlowRoutePlan`]
//! into a realized [`ExchangeRoute`] with every endpoint resolved and
//! every binding active at the gateway.

pub mod engine;
pub mod gateway;

pub use engine::ExchangeRouteEngine;
pub use gateway::{FlowGwClientManager, GatewayClient};

use crate::device::DeviceInfo;
use crate::route::{EndpointIndex, EndpointKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolved physical identity of an endpoint after materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysicalId {
    /// An on-device queue id.
    Queue(u64),
    /// An hcom handle identifier.
    Hcom(String),
    /// A group id.
    Group(u64),
}

/// A realized endpoint: its original kind/device plus a resolved
/// physical id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEndpoint {
    /// Original endpoint kind.
    pub kind: EndpointKind,
    /// Owning device.
    pub device: DeviceInfo,
    /// Resolved physical id.
    pub physical_id: PhysicalId,
    /// For Group endpoints, the current live member set (may shrink
    /// under exception updates).
    pub members: Vec<EndpointIndex>,
}

/// A materialized `(src, dst)` routing pair, installed at the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPair {
    /// Source endpoint index.
    pub src: EndpointIndex,
    /// Destination endpoint index.
    pub dst: EndpointIndex,
}

/// The realized `FlowRoutePlan`: an ordered mapping `index ->
/// ExchangeEndpoint`, the materialized routing pairs, and per-group
/// member sets. Owned by the `DeployContext` of the session; destroyed
/// at undeploy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeRoute {
    /// Node this route was realized on.
    pub node_id: String,
    /// Realized endpoints, indexed identically to the source
    /// `FlowRoutePlan`.
    pub endpoints: HashMap<EndpointIndex, ExchangeEndpoint>,
    /// Active routing pairs.
    pub queue_routes: Vec<RoutingPair>,
    /// Whether each endpoint index has an active (non-deleted)
    /// existence; exception updates clear entries here without
    /// shifting others' indices.
    pub live: HashMap<EndpointIndex, bool>,
}

impl ExchangeRoute {
    /// Construct an empty route for the given node.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            endpoints: HashMap::new(),
            queue_routes: Vec::new(),
            live: HashMap::new(),
        }
    }

    /// Whether the endpoint at `index` is still live (not torn down by
    /// an exception update).
    #[must_use]
    pub fn is_live(&self, index: EndpointIndex) -> bool {
        self.live.get(&index).copied().unwrap_or(false)
    }
}

//! [`NodeRouter`]: dispatches [`RemoteDeployer`] calls to the right
//! remote node's [`DeployTransportClient`], keyed by node id.
//!
//! The core crate's orchestrator is written against a single
//! `RemoteDeployer` collaborator (mirroring the corpus's pattern of one
//! trait object per cross-process concern); a real deployment mesh has
//! one gRPC endpoint per node, so the CLI needs this thin fan-out layer
//! to present the whole mesh as one `RemoteDeployer`.

use async_trait::async_trait;
use hetero_deploy::error::{Error, Result};
use hetero_deploy::executor::BatchLoadEntry;
use hetero_deploy::orchestrator::{DevMaintenanceCfg, RemoteDeployer};
use hetero_deploy::plan::DeployPlan;
use hetero_deploy_transport::{DeployTransportClient, DeployTransportClientConfig};
use std::collections::HashMap;

/// Fans `RemoteDeployer` calls out to one [`DeployTransportClient`] per
/// node, constructed lazily from a static `node_id -> endpoint` map.
pub struct NodeRouter {
    clients: HashMap<String, DeployTransportClient>,
}

impl NodeRouter {
    /// Build a router from a `node_id -> gRPC endpoint` map, applying
    /// the same client config (timeout, retry budget, chunk size) to
    /// every node.
    #[must_use]
    pub fn new(endpoints: HashMap<String, String>, client_config: DeployTransportClientConfig) -> Self {
        let clients = endpoints
            .into_iter()
            .map(|(node_id, endpoint)| {
                let config = DeployTransportClientConfig {
                    endpoint,
                    ..client_config.clone()
                };
                (node_id, DeployTransportClient::new(config))
            })
            .collect();
        Self { clients }
    }

    fn client(&self, node_id: &str) -> Result<&DeployTransportClient> {
        self.clients
            .get(node_id)
            .ok_or_else(|| Error::ParamInvalid(format!("no transport endpoint configured for node {node_id}")))
    }
}

#[async_trait]
impl RemoteDeployer for NodeRouter {
    async fn deploy_dev_maintenance_cfg(&self, node_id: &str, cfg: &DevMaintenanceCfg) -> Result<()> {
        self.client(node_id)?.deploy_dev_maintenance_cfg(node_id, cfg).await
    }

    async fn transfer_artifacts(&self, node_id: &str, plan: &DeployPlan) -> Result<()> {
        self.client(node_id)?.transfer_artifacts(node_id, plan).await
    }

    async fn load_submodels(&self, node_id: &str, batch: Vec<BatchLoadEntry>) -> Result<()> {
        self.client(node_id)?.load_submodels(node_id, batch).await
    }

    async fn undeploy(&self, node_id: &str) -> Result<()> {
        self.client(node_id)?.undeploy(node_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_node_is_rejected_before_dialing() {
        let router = NodeRouter::new(HashMap::new(), DeployTransportClientConfig::default());
        assert!(router.client("node-9").is_err());
    }

    #[test]
    fn configured_node_resolves_to_its_own_endpoint() {
        let mut endpoints = HashMap::new();
        endpoints.insert("node-1".to_string(), "http://node-1:7070".to_string());
        let router = NodeRouter::new(endpoints, DeployTransportClientConfig::default());
        assert!(router.client("node-1").is_ok());
    }
}

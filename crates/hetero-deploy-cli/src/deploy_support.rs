//! Shared scaffolding for the `deploy`/`undeploy` commands: building a
//! [`HeterogeneousModelDeployer`] from CLI-supplied files, and
//! persisting enough of the resulting [`DeployContext`] to disk that a
//! later, separate `undeploy` invocation can tear the same deployment
//! back down.
//!
//! A one-shot CLI process cannot hold a live `DeployContext` across
//! invocations the way a long-running deployer daemon would, so
//! `deploy` snapshots the bookkeeping `undeploy_model` needs
//! (deployed node ids, and the local node's realized `ExchangeRoute`)
//! into a small JSON state file next to the session.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hetero_deploy::exchange::ExchangeRoute;
use hetero_deploy::exchange::ExchangeRouteEngine;
use hetero_deploy::executor::BatchLoadEntry;
use hetero_deploy::orchestrator::{DevMaintenanceCfg, HeterogeneousModelDeployer, LocalLoader, RemoteDeployer};
use hetero_deploy_transport::{DeployTransportClient, DeployTransportClientConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::node_router::NodeRouter;

/// Adapts the local node's own [`DeployTransportClient`] (the CLI's
/// `--local-gateway` endpoint) to [`LocalLoader`].
///
/// A one-shot CLI invocation has no embedded `ExecutorManager` of its
/// own — the long-running node agent process behind `--local-gateway`
/// owns that — so "load locally" still crosses a process boundary here,
/// just a loopback one to this node's own `DeployTransport` server
/// rather than a fan-out to a remote node.
struct LocalGatewayLoader {
    client: Arc<DeployTransportClient>,
    local_node_id: String,
}

#[async_trait]
impl LocalLoader for LocalGatewayLoader {
    async fn load_submodels(&self, batch: Vec<BatchLoadEntry>) -> hetero_deploy::error::Result<()> {
        self.client.load_submodels(&self.local_node_id, batch).await
    }
}

/// Arguments shared by `deploy` and `undeploy` for reaching the local
/// gateway and the rest of the node mesh.
#[derive(Clone, Debug, clap::Args)]
pub struct MeshArgs {
    /// gRPC endpoint of this node's own gateway/transport server.
    #[arg(long, default_value = "http://localhost:7070")]
    pub local_gateway: String,

    /// This node's identifier, as used in the flow model's device
    /// placements.
    #[arg(long)]
    pub local_node: String,

    /// Path to a JSON file mapping `node_id -> gRPC endpoint` for every
    /// other node in the mesh.
    #[arg(long)]
    pub nodes: PathBuf,

    /// Per-call timeout, in milliseconds, for transport RPCs.
    #[arg(long, default_value = "30000")]
    pub timeout_ms: u64,
}

impl MeshArgs {
    fn client_config(&self) -> DeployTransportClientConfig {
        DeployTransportClientConfig {
            timeout: std::time::Duration::from_millis(self.timeout_ms),
            ..DeployTransportClientConfig::default()
        }
    }

    /// Build the local gateway client (used as both `GatewayClient` for
    /// the local `ExchangeRouteEngine` and as the loopback transport for
    /// `LoadSubmodels` against this node's own `DeployTransport` server).
    pub fn local_gateway_client(&self) -> Arc<DeployTransportClient> {
        let config = DeployTransportClientConfig {
            endpoint: self.local_gateway.clone(),
            ..self.client_config()
        };
        Arc::new(DeployTransportClient::new(config))
    }

    /// Build the exchange route engine bound to the local gateway.
    pub fn exchange_engine(&self) -> Arc<ExchangeRouteEngine> {
        Arc::new(ExchangeRouteEngine::new(self.local_gateway_client()))
    }

    /// Build the local-node `LoadSubmodels` loader, looping back to
    /// this node's own gateway endpoint.
    pub fn local_loader(&self, local_node_id: &str) -> Arc<dyn hetero_deploy::orchestrator::LocalLoader> {
        Arc::new(LocalGatewayLoader {
            client: self.local_gateway_client(),
            local_node_id: local_node_id.to_string(),
        })
    }

    /// Build the fan-out `RemoteDeployer` for every other node in the
    /// mesh, loaded from `self.nodes`.
    pub fn node_router(&self) -> Result<Arc<NodeRouter>> {
        let endpoints = crate::io::load_node_endpoints(&self.nodes)?;
        Ok(Arc::new(NodeRouter::new(endpoints, self.client_config())))
    }
}

/// Snapshot of a deployed session's bookkeeping, persisted to disk so a
/// later `undeploy` invocation can reconstruct enough of the
/// `DeployContext` to call `undeploy_model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Session name the deployment was made under.
    pub session_name: String,
    /// Deploy context id.
    pub context_id: String,
    /// Local node id at deploy time.
    pub local_node_id: String,
    /// Every node id the deploy routine recorded as loaded.
    pub deployed_node_ids: HashSet<String>,
    /// The local node's realized route, if the local node took part.
    pub local_route: Option<ExchangeRoute>,
}

impl DeploymentRecord {
    /// Default state-file path for a session, next to the working
    /// directory the CLI was invoked from.
    #[must_use]
    pub fn default_path(session_name: &str) -> PathBuf {
        PathBuf::from(format!("{session_name}.hetero-deploy-state.json"))
    }

    /// Persist this record as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serializing deployment record")?;
        std::fs::write(path.as_ref(), text).with_context(|| format!("writing {}", path.as_ref().display()))
    }

    /// Load a previously persisted record.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).with_context(|| format!("reading {}", path.as_ref().display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.as_ref().display()))
    }

    /// Rehydrate a `DeployContext` from this record, suitable for
    /// passing to `HeterogeneousModelDeployer::undeploy_model`.
    #[must_use]
    pub fn rehydrate(&self) -> hetero_deploy::deploy_context::DeployContext {
        let ctx = hetero_deploy::deploy_context::DeployContext::new(self.session_name.clone(), self.context_id.clone());
        for node in &self.deployed_node_ids {
            ctx.mark_node_deployed(node.clone());
        }
        if let Some(route) = &self.local_route {
            ctx.set_route(self.local_node_id.clone(), route.clone());
        }
        ctx
    }
}

/// Build a `DevMaintenanceCfg` from the optional CLI strings, defaulting
/// every field to empty (no maintenance options pushed).
#[must_use]
pub fn maintenance_cfg(log_options: Option<String>, dump_options: Option<String>, profiling_options: Option<String>) -> DevMaintenanceCfg {
    DevMaintenanceCfg {
        log_options: log_options.unwrap_or_default(),
        dump_options: dump_options.unwrap_or_default(),
        profiling_options: profiling_options.unwrap_or_default(),
    }
}

/// Construct the end-to-end deployer for one CLI invocation.
#[must_use]
pub fn build_deployer<'a>(
    local_node_id: &str,
    resource_manager: &'a dyn hetero_deploy::device::ResourceManager,
    exchange_engine: Arc<ExchangeRouteEngine>,
    remote: Arc<NodeRouter>,
    local_loader: Arc<dyn LocalLoader>,
) -> HeterogeneousModelDeployer<'a> {
    HeterogeneousModelDeployer::new(local_node_id, resource_manager, exchange_engine, remote, local_loader)
}

/// Derive an empty-batch `BatchForNode` closure. Real submodel binaries
/// and resolved queue attributes are supplied by the exchange route
/// engine and the artifact-transfer step; this CLI does not itself
/// resolve per-submodel batch-load entries, so every node loads with an
/// empty batch. Operators driving real executor fan-out should supply
/// pre-computed batches out of band (see `DESIGN.md`).
#[must_use]
pub fn empty_batch_for_node() -> hetero_deploy::orchestrator::BatchForNode {
    Box::new(|_node_id: &str| Vec::new())
}

/// Convenience: collect the remote node ids touched by a plan that are
/// not the local node, for logging.
#[must_use]
pub fn remote_node_ids(plan: &hetero_deploy::plan::DeployPlan, local_node_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = plan.route_plans.keys().filter(|n| n.as_str() != local_node_id).cloned().collect();
    ids.sort();
    ids
}

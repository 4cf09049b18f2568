//! `hetero-deploy undeploy`: tear down a session previously deployed by
//! `hetero-deploy deploy`, using the deployment record it wrote.

use crate::deploy_support::{build_deployer, DeploymentRecord, MeshArgs};
use crate::output::{print_info, print_success};
use anyhow::{Context, Result};
use clap::Args;
use hetero_deploy::device::ResourceManager;
use std::path::PathBuf;

/// A `ResourceManager` that never allocates; `undeploy` never calls the
/// planner, but `HeterogeneousModelDeployer::new` still requires one.
struct NoAllocResourceManager {
    node_id: String,
}

impl ResourceManager for NoAllocResourceManager {
    fn local_node_id(&self) -> &str {
        &self.node_id
    }

    fn devices(&self) -> Vec<hetero_deploy::device::DeviceCapability> {
        Vec::new()
    }

    fn allocate(
        &self,
        _engine: hetero_deploy::model::Engine,
        _pinned_device: Option<&str>,
    ) -> hetero_deploy::error::Result<hetero_deploy::device::DeviceInfo> {
        Err(hetero_deploy::error::Error::Unsupported("undeploy does not allocate devices".to_string()))
    }
}

/// Tear down a previously deployed session.
#[derive(Args)]
pub struct UndeployArgs {
    #[command(flatten)]
    pub mesh: MeshArgs,

    /// Session name to undeploy.
    #[arg(long, default_value = "default")]
    pub session: String,

    /// Path to the deployment record written by `deploy`. Defaults to
    /// `<session>.hetero-deploy-state.json`.
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

pub async fn run(args: UndeployArgs) -> Result<()> {
    let state_path = args.state_file.clone().unwrap_or_else(|| DeploymentRecord::default_path(&args.session));
    let record = DeploymentRecord::load(&state_path).with_context(|| format!("loading deployment record from {}", state_path.display()))?;

    let resource_manager = NoAllocResourceManager {
        node_id: record.local_node_id.clone(),
    };
    let exchange_engine = args.mesh.exchange_engine();
    let remote = args.mesh.node_router()?;
    let local_loader = args.mesh.local_loader(&record.local_node_id);
    let deployer = build_deployer(&record.local_node_id, &resource_manager, exchange_engine, remote, local_loader);

    print_info(&format!("undeploying session '{}' ({} node(s))", record.session_name, record.deployed_node_ids.len()));
    let ctx = record.rehydrate();
    deployer.undeploy_model(&ctx).await.context("undeploy failed")?;

    std::fs::remove_file(&state_path).with_context(|| format!("removing {}", state_path.display()))?;
    print_success(&format!("session '{}' undeployed", record.session_name));
    Ok(())
}

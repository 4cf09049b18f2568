//! `hetero-deploy deploy`: plan and deploy a flow model across the
//! configured node mesh.

use crate::deploy_support::{build_deployer, empty_batch_for_node, maintenance_cfg, remote_node_ids, DeploymentRecord, MeshArgs};
use crate::io::load_flow_model;
use crate::output::{print_error, print_info, print_success};
use crate::resource_manager::FileResourceManager;
use anyhow::{Context, Result};
use clap::Args;
use hetero_deploy::deploy_context::DeployContext;
use hetero_deploy::device::ResourceManager;
use std::path::PathBuf;
use uuid::Uuid;

/// Deploy a flow model.
#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub mesh: MeshArgs,

    /// Path to the flow model, as JSON.
    #[arg(long)]
    pub model: PathBuf,

    /// Path to this node's device inventory, as JSON.
    #[arg(long)]
    pub devices: PathBuf,

    /// Session name; used to namespace the deploy context and the
    /// persisted deployment record.
    #[arg(long, default_value = "default")]
    pub session: String,

    /// `--log`-style maintenance option string pushed to remote nodes.
    #[arg(long)]
    pub log_options: Option<String>,

    /// `--dump`-style maintenance option string pushed to remote nodes.
    #[arg(long)]
    pub dump_options: Option<String>,

    /// `--profiling`-style maintenance option string pushed to remote
    /// nodes.
    #[arg(long)]
    pub profiling_options: Option<String>,

    /// Where to write the deployment record consumed by a later
    /// `undeploy`. Defaults to `<session>.hetero-deploy-state.json`.
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

pub async fn run(args: DeployArgs) -> Result<()> {
    let model = load_flow_model(&args.model)?;
    let resource_manager = FileResourceManager::load(&args.devices).context("loading device inventory")?;
    let local_node_id = resource_manager.local_node_id().to_string();

    if local_node_id != args.mesh.local_node {
        print_error(&format!(
            "device inventory declares node '{local_node_id}' but --local-node was '{}'",
            args.mesh.local_node
        ));
        anyhow::bail!("local node id mismatch between device inventory and --local-node");
    }

    let exchange_engine = args.mesh.exchange_engine();
    let remote = args.mesh.node_router()?;
    let local_loader = args.mesh.local_loader(&local_node_id);
    let deployer = build_deployer(&local_node_id, &resource_manager, exchange_engine, remote, local_loader);

    let context_id = Uuid::new_v4().to_string();
    let ctx = DeployContext::new(args.session.clone(), context_id.clone());
    let cfg = maintenance_cfg(args.log_options, args.dump_options, args.profiling_options);
    let batch = empty_batch_for_node();

    print_info(&format!("deploying model '{}' as session '{}'", model.name, args.session));
    let plan = deployer.deploy_model(&model, &ctx, &cfg, &batch).await.context("deploy failed")?;

    if plan.is_empty() {
        print_success("deploy plan was empty; nothing to do");
        return Ok(());
    }

    let remotes = remote_node_ids(&plan, &local_node_id);
    print_success(&format!(
        "deployed across {} node(s) ({} remote): {}",
        plan.endpoint_node_ids().len(),
        remotes.len(),
        remotes.join(", ")
    ));

    let deployed_node_ids = ctx.deployed_node_ids();
    let local_route = ctx.take_route(&local_node_id);
    let record = DeploymentRecord {
        session_name: args.session.clone(),
        context_id,
        local_node_id: local_node_id.clone(),
        deployed_node_ids,
        local_route,
    };
    let state_path = args.state_file.unwrap_or_else(|| DeploymentRecord::default_path(&args.session));
    record.save(&state_path)?;
    print_info(&format!("deployment record written to {}", state_path.display()));

    Ok(())
}

//! `hetero-deploy status`: query every configured node's heartbeat and
//! report device health.

use crate::io::load_node_endpoints;
use crate::output::{create_table, print_error};
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use hetero_deploy_transport::{DeployTransportClient, DeployTransportClientConfig};
use std::path::PathBuf;

/// Query node health.
#[derive(Args)]
pub struct StatusArgs {
    /// Path to a JSON file mapping `node_id -> gRPC endpoint` for the
    /// nodes to check. The local gateway is checked too, under the id
    /// given by `--local-node`.
    #[arg(long)]
    pub nodes: PathBuf,

    /// This node's identifier and gRPC endpoint, checked alongside the
    /// remote nodes.
    #[arg(long)]
    pub local_node: Option<String>,

    /// gRPC endpoint for `--local-node`.
    #[arg(long, default_value = "http://localhost:7070")]
    pub local_gateway: String,

    /// Heartbeat sequence number to send.
    #[arg(long, default_value = "0")]
    pub sequence: u64,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let mut endpoints = load_node_endpoints(&args.nodes)?;
    if let Some(local_node) = &args.local_node {
        endpoints.insert(local_node.clone(), args.local_gateway.clone());
    }

    let mut table = create_table();
    table.set_header(vec!["node", "endpoint", "status", "abnormal devices"]);

    let mut any_down = false;
    let mut rows: Vec<(String, String)> = endpoints.into_iter().collect();
    rows.sort();
    for (node_id, endpoint) in rows {
        let client = DeployTransportClient::new(DeployTransportClientConfig {
            endpoint: endpoint.clone(),
            ..DeployTransportClientConfig::default()
        });
        match client.heartbeat(&node_id, args.sequence).await {
            Ok(states) => {
                let abnormal = states.abnormal_devices();
                let status = if abnormal.is_empty() {
                    "healthy".bright_green().to_string()
                } else {
                    "degraded".bright_yellow().to_string()
                };
                let devices = abnormal.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                table.add_row(vec![node_id, endpoint, status, devices]);
            }
            Err(err) => {
                any_down = true;
                table.add_row(vec![node_id, endpoint, "unreachable".bright_red().to_string(), err.to_string()]);
            }
        }
    }

    println!("{table}");

    if any_down {
        print_error("one or more nodes are unreachable");
        anyhow::bail!("status check found unreachable nodes");
    }
    Ok(())
}

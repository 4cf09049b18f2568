//! `hetero-deploy watch`: poll the configured node mesh's heartbeat on
//! an interval and print a refreshed device-health table, until
//! interrupted.

use crate::io::load_node_endpoints;
use crate::output::{create_table, print_info};
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use hetero_deploy_transport::{DeployTransportClient, DeployTransportClientConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Continuously poll node health.
#[derive(Args)]
pub struct WatchArgs {
    /// Path to a JSON file mapping `node_id -> gRPC endpoint`.
    #[arg(long)]
    pub nodes: PathBuf,

    /// This node's identifier, checked alongside the remote nodes.
    #[arg(long)]
    pub local_node: Option<String>,

    /// gRPC endpoint for `--local-node`.
    #[arg(long, default_value = "http://localhost:7070")]
    pub local_gateway: String,

    /// Refresh interval, in milliseconds.
    #[arg(long, default_value = "1000")]
    pub refresh_ms: u64,

    /// Exit after this many refreshes instead of running forever. Mainly
    /// useful for scripting and tests.
    #[arg(long)]
    pub iterations: Option<u32>,
}

pub async fn run(args: WatchArgs) -> Result<()> {
    let mut endpoints = load_node_endpoints(&args.nodes)?;
    if let Some(local_node) = &args.local_node {
        endpoints.insert(local_node.clone(), args.local_gateway.clone());
    }
    let mut nodes: Vec<(String, String)> = endpoints.into_iter().collect();
    nodes.sort();

    let clients: Vec<(String, String, DeployTransportClient)> = nodes
        .into_iter()
        .map(|(node_id, endpoint)| {
            let client = DeployTransportClient::new(DeployTransportClientConfig {
                endpoint: endpoint.clone(),
                ..DeployTransportClientConfig::default()
            });
            (node_id, endpoint, client)
        })
        .collect();

    let mut interval = tokio::time::interval(Duration::from_millis(args.refresh_ms));
    let mut sequence: u64 = 0;
    let mut ticks = 0u32;

    loop {
        interval.tick().await;
        render_once(&clients, sequence).await;
        sequence += 1;
        ticks += 1;
        if let Some(limit) = args.iterations {
            if ticks >= limit {
                break;
            }
        }
    }

    print_info("watch stopped");
    Ok(())
}

async fn render_once(clients: &[(String, String, DeployTransportClient)], sequence: u64) {
    print!("\x1B[2J\x1B[1;1H");
    println!("{}", format!("hetero-deploy watch — sequence {sequence}").bold());

    let mut table = create_table();
    table.set_header(vec!["node", "endpoint", "status", "abnormal devices"]);

    for (node_id, endpoint, client) in clients {
        match client.heartbeat(node_id, sequence).await {
            Ok(states) => {
                let abnormal = states.abnormal_devices();
                let status = if abnormal.is_empty() {
                    "healthy".bright_green().to_string()
                } else {
                    "degraded".bright_yellow().to_string()
                };
                let devices = abnormal.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                table.add_row(vec![node_id.clone(), endpoint.clone(), status, devices]);
            }
            Err(err) => {
                table.add_row(vec![node_id.clone(), endpoint.clone(), "unreachable".bright_red().to_string(), err.to_string()]);
            }
        }
    }

    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_args_parse_with_defaults() {
        use clap::Parser;
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: WatchArgs,
        }
        let wrapper = Wrapper::try_parse_from(["test", "--nodes", "nodes.json"]).unwrap();
        assert_eq!(wrapper.args.refresh_ms, 1000);
        assert_eq!(wrapper.args.local_gateway, "http://localhost:7070");
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod deploy_support;
mod io;
mod node_router;
mod output;
mod resource_manager;

use commands::{deploy, status, undeploy, watch};
use hetero_deploy_observability::LoggingConfig;

/// hetero-deploy — operator CLI for deploying, undeploying, and
/// monitoring heterogeneous flow models.
#[derive(Parser)]
#[command(name = "hetero-deploy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy, undeploy, and monitor heterogeneous flow models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit JSON-formatted log lines instead of human-readable ones.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a flow model across the configured node mesh.
    Deploy(deploy::DeployArgs),

    /// Undeploy a previously deployed session.
    Undeploy(undeploy::UndeployArgs),

    /// Check node health once and exit.
    Status(status::StatusArgs),

    /// Continuously poll node health until interrupted.
    Watch(watch::WatchArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        json: cli.json_logs,
        ..LoggingConfig::default()
    };
    let _ = logging.init();

    match cli.command {
        Commands::Deploy(args) => deploy::run(args).await,
        Commands::Undeploy(args) => undeploy::run(args).await,
        Commands::Status(args) => status::run(args).await,
        Commands::Watch(args) => watch::run(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses_known_subcommands() {
        let cli = Cli::try_parse_from(["hetero-deploy", "status", "--nodes", "nodes.json"]).expect("parse status");
        assert!(matches!(cli.command, Commands::Status(_)));
    }

    #[test]
    fn clap_enforces_required_args() {
        assert!(Cli::try_parse_from(["hetero-deploy", "deploy"]).is_err());
        assert!(Cli::try_parse_from(["hetero-deploy", "status"]).is_err());
    }
}

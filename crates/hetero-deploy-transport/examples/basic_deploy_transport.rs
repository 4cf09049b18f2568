//! Minimal `DeployTransport` round trip: start a server over an
//! in-memory `DeployTransportHandler`, connect a client, and drive a
//! create-endpoint/bind/heartbeat sequence.
//!
//! Run with: cargo run --example basic_deploy_transport

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hetero_deploy::device::{DeviceInfo, DeviceType};
use hetero_deploy::error::Result as CoreResult;
use hetero_deploy::executor::BatchLoadEntry;
use hetero_deploy::exchange::PhysicalId;
use hetero_deploy::orchestrator::DevMaintenanceCfg;
use hetero_deploy::plan::DeployPlan;
use hetero_deploy::route::EndpointDesc;
use hetero_deploy_transport::proto::deploy_transport_server::DeployTransportServer as GrpcServer;
use hetero_deploy_transport::server::HeartbeatReport;
use hetero_deploy_transport::{DeployTransportClient, DeployTransportClientConfig, DeployTransportHandler, DeployTransportServer};
use tempfile::tempdir;
use tonic::transport::Server;

#[derive(Default)]
struct InMemoryHandler {
    next_queue_id: Mutex<u64>,
    base_dir: std::path::PathBuf,
}

#[async_trait]
impl DeployTransportHandler for InMemoryHandler {
    async fn deploy_dev_maintenance_cfg(&self, node_id: &str, _cfg: &DevMaintenanceCfg) -> CoreResult<()> {
        println!("[node-agent] maintenance config pushed to {node_id}");
        Ok(())
    }

    async fn download_dev_maintenance_cfg(&self, _node_id: &str) -> CoreResult<DevMaintenanceCfg> {
        Ok(DevMaintenanceCfg::default())
    }

    async fn transfer_artifacts(&self, node_id: &str, plan: &DeployPlan) -> CoreResult<()> {
        println!("[node-agent] received deploy plan for {node_id}: {} submodels placed", plan.assignment.len());
        Ok(())
    }

    async fn load_submodels(&self, node_id: &str, batch: Vec<BatchLoadEntry>) -> CoreResult<()> {
        println!("[node-agent] loading {} submodels on {node_id}", batch.len());
        Ok(())
    }

    async fn undeploy(&self, node_id: &str) -> CoreResult<()> {
        println!("[node-agent] undeploy on {node_id}");
        Ok(())
    }

    async fn create_endpoint(&self, endpoint: &EndpointDesc) -> CoreResult<PhysicalId> {
        let mut next = self.next_queue_id.lock().expect("lock poisoned");
        let id = *next;
        *next += 1;
        println!("[node-agent] created endpoint {} -> queue {id}", endpoint.name);
        Ok(PhysicalId::Queue(id))
    }

    async fn destroy_endpoint(&self, _physical_id: &PhysicalId) -> CoreResult<()> {
        Ok(())
    }

    async fn create_group(&self, members: &[PhysicalId]) -> CoreResult<PhysicalId> {
        Ok(PhysicalId::Group(members.len() as u64))
    }

    async fn destroy_group(&self, _group: &PhysicalId) -> CoreResult<()> {
        Ok(())
    }

    async fn bind(&self, src: &PhysicalId, dst: &PhysicalId) -> CoreResult<()> {
        println!("[node-agent] bind {src:?} -> {dst:?}");
        Ok(())
    }

    async fn unbind(&self, _src: &PhysicalId, _dst: &PhysicalId) -> CoreResult<()> {
        Ok(())
    }

    async fn reroute(&self, _src: &PhysicalId, _old_dst: &PhysicalId, _new_dst: &PhysicalId) -> CoreResult<()> {
        Ok(())
    }

    async fn notify_data_flow_exception(&self, trans_id: u64, scope: &str, code: i32, _context: &[u8]) -> CoreResult<()> {
        println!("[node-agent] data-flow exception trans_id={trans_id} scope={scope:?} code={code}");
        Ok(())
    }

    async fn heartbeat(&self, node_id: &str, sequence: u64) -> CoreResult<HeartbeatReport> {
        println!("[node-agent] heartbeat #{sequence} from {node_id}");
        Ok(HeartbeatReport::default())
    }

    fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let base_dir = tempdir()?;
    let mut handler = InMemoryHandler::default();
    handler.base_dir = base_dir.path().to_path_buf();
    let handler = Arc::new(handler);

    let addr = "127.0.0.1:0".parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let grpc_service = GrpcServer::new(DeployTransportServer::new(handler));
    tokio::spawn(async move {
        Server::builder()
            .add_service(grpc_service)
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .expect("server failed");
    });

    let client = DeployTransportClient::new(DeployTransportClientConfig {
        endpoint: format!("http://{local_addr}"),
        ..Default::default()
    });

    let report = client.heartbeat("node-0", 1).await?;
    println!("client observed {} abnormal devices", report.abnormal_devices().len());

    use hetero_deploy::exchange::GatewayClient;
    let endpoint = EndpointDesc::queue("root.out", DeviceInfo::new(DeviceType::Npu, "node-0", 0));
    let queue = client.create_endpoint(&endpoint).await?;
    println!("created endpoint -> {queue:?}");

    Ok(())
}

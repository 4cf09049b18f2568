//! gRPC-backed implementations of the core crate's `GatewayClient` and
//! `RemoteDeployer` traits.
//!
//! [`DeployTransportClient`] wraps one `tonic` channel to a remote
//! node's `DeployTransport` service and answers both collaborator
//! contracts from it, plus the file-transport and heartbeat calls the
//! orchestrator and abnormal-status handler need directly.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hetero_deploy::device::DeviceStateList;
use hetero_deploy::error::Result as CoreResult;
use hetero_deploy::executor::BatchLoadEntry;
use hetero_deploy::exchange::{GatewayClient, PhysicalId};
use hetero_deploy::orchestrator::{DevMaintenanceCfg, RemoteDeployer};
use hetero_deploy::plan::DeployPlan;
use hetero_deploy::route::EndpointDesc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tonic::transport::Channel;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::codec::{decode_str, encode, encode_str};
use crate::error::{Error, Result};
use crate::file_transport::read_chunks;
use crate::proto::deploy_transport_client::DeployTransportClient as GrpcClient;
use crate::proto::{
    BindRequest, CreateEndpointRequest, CreateGroupRequest, DataFlowExceptionRequest,
    HeartbeatRequest, LoadSubmodelsRequest, MaintenanceCfgRequest, PhysicalIdRequest,
    RerouteRequest, TransferArtifactsRequest, UndeployRequest,
};

/// Configuration for one [`DeployTransportClient`].
#[derive(Debug, Clone)]
pub struct DeployTransportClientConfig {
    /// gRPC endpoint of the remote node's `DeployTransport` server,
    /// e.g. `http://node-1:7070`.
    pub endpoint: String,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Chunk size used when streaming files via `transfer_file`.
    pub chunk_size: usize,
    /// Max attempts for calls the gateway considers safe to retry
    /// (bind/unbind/reroute/destroy/heartbeat): idempotent at the
    /// gateway, so a transient failure can simply be reissued. Creates
    /// and the artifact/load transfer calls are not retried here since
    /// a retry could duplicate a non-idempotent side effect; their
    /// callers handle failure at the step level instead, via a
    /// compensating undeploy.
    pub max_retries: usize,
}

impl Default for DeployTransportClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:7070".to_string(),
            timeout: Duration::from_secs(30),
            chunk_size: 1 << 20,
            max_retries: 3,
        }
    }
}

/// A client for one remote node's `DeployTransport` service.
///
/// The underlying `tonic` channel is created lazily on first call and
/// cached; `GatewayClient`/`RemoteDeployer` calls never race to create
/// two channels for the same client.
pub struct DeployTransportClient {
    config: DeployTransportClientConfig,
    channel: AsyncMutex<Option<GrpcClient<Channel>>>,
}

impl DeployTransportClient {
    /// Construct a client for the given config. No connection is
    /// attempted until the first call.
    #[must_use]
    pub fn new(config: DeployTransportClientConfig) -> Self {
        Self {
            config,
            channel: AsyncMutex::new(None),
        }
    }

    async fn client(&self) -> Result<GrpcClient<Channel>> {
        let mut guard = self.channel.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let endpoint = tonic::transport::Endpoint::from_shared(self.config.endpoint.clone())
            .map_err(|e| Error::Configuration(e.to_string()))?
            .timeout(self.config.timeout);
        let channel = endpoint.connect().await?;
        let client = GrpcClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Retries `action` with jittered exponential backoff while the
    /// error it returns is `is_retryable()`, up to `config.max_retries`
    /// attempts total.
    async fn call_with_retry<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let call_id = Uuid::new_v4();
        trace!(%call_id, max_retries = self.config.max_retries, "dispatching retryable call");
        let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(self.config.max_retries.saturating_sub(1));
        RetryIf::spawn(strategy, action, Error::is_retryable).await
    }

    fn status_ok(ok: bool, error_message: String, retryable: bool) -> Result<()> {
        if ok {
            Ok(())
        } else if retryable {
            Err(Error::Status(Box::new(tonic::Status::unavailable(error_message))))
        } else {
            Err(Error::Status(Box::new(tonic::Status::internal(error_message))))
        }
    }

    /// Poll this node's heartbeat, returning the abnormal-device and
    /// abnormal-submodel-instance sets it reports this round (the
    /// source reports the full current set every heartbeat; see
    /// DESIGN.md's resolution of that open question).
    pub async fn heartbeat(&self, node_id: &str, sequence: u64) -> Result<DeviceStateList> {
        let resp = self
            .call_with_retry(|| async move {
                let mut client = self.client().await?;
                let resp = client
                    .heartbeat(HeartbeatRequest {
                        node_id: node_id.to_string(),
                        sequence,
                    })
                    .await?
                    .into_inner();
                Self::status_ok(resp.ok, resp.error_message, resp.retryable)?;
                Ok(resp)
            })
            .await?;

        let mut table = DeviceStateList::new();
        for device_json in &resp.abnormal_devices_json {
            let device = decode_str(device_json)?;
            table.set_healthy(device, false);
        }
        Ok(table)
    }

    /// Report a data-flow exception observed on this node's executors
    /// to the local handler (used when this client is embedded
    /// server-side as a loopback to the local `DeployContext`; remote
    /// callers use the generated service directly).
    pub async fn notify_data_flow_exception(&self, trans_id: u64, scope: &str, code: i32, context: Vec<u8>) -> Result<()> {
        let mut client = self.client().await?;
        let resp = client
            .notify_data_flow_exception(DataFlowExceptionRequest {
                trans_id,
                scope: scope.to_string(),
                code,
                context,
            })
            .await?
            .into_inner();
        Self::status_ok(resp.ok, resp.error_message, resp.retryable)
    }

    /// Stream a local file to this node's base directory, chunked at
    /// `config.chunk_size`, verifying sha256 end-to-end.
    pub async fn transfer_file(&self, path: &Path, session_id: &str, root_model: &str, relative_path: &str) -> Result<u64> {
        let chunks = read_chunks(path, session_id, root_model, relative_path, self.config.chunk_size).await?;
        let mut client = self.client().await?;
        let stream = tokio_stream::iter(chunks);
        let resp = client.transfer_file(stream).await?.into_inner();
        if !resp.ok {
            return Err(Error::FileIntegrity(resp.error_message));
        }
        Ok(resp.bytes_written)
    }
}

#[async_trait]
impl GatewayClient for DeployTransportClient {
    async fn create_endpoint(&self, endpoint: &EndpointDesc) -> CoreResult<PhysicalId> {
        let req = CreateEndpointRequest {
            endpoint_json: encode(endpoint).map_err(transport_to_core)?,
        };
        let mut client = self.client().await.map_err(transport_to_core)?;
        let resp = client.create_endpoint(req).await.map_err(Error::from).map_err(transport_to_core)?.into_inner();
        Self::status_ok(resp.ok, resp.error_message, resp.retryable).map_err(transport_to_core)?;
        decode_str(&resp.physical_id_json).map_err(transport_to_core)
    }

    async fn destroy_endpoint(&self, physical_id: &PhysicalId) -> CoreResult<()> {
        let req = PhysicalIdRequest {
            physical_id_json: encode_str(physical_id).map_err(transport_to_core)?,
        };
        self.call_with_retry(|| {
            let req = req.clone();
            async move {
                let mut client = self.client().await?;
                let resp = client.destroy_endpoint(req).await?.into_inner();
                Self::status_ok(resp.ok, resp.error_message, resp.retryable)
            }
        })
        .await
        .map_err(transport_to_core)
    }

    async fn create_group(&self, members: &[PhysicalId]) -> CoreResult<PhysicalId> {
        let member_physical_ids_json = members
            .iter()
            .map(encode_str)
            .collect::<Result<Vec<_>>>()
            .map_err(transport_to_core)?;
        let req = CreateGroupRequest { member_physical_ids_json };
        let mut client = self.client().await.map_err(transport_to_core)?;
        let resp = client.create_group(req).await.map_err(Error::from).map_err(transport_to_core)?.into_inner();
        Self::status_ok(resp.ok, resp.error_message, resp.retryable).map_err(transport_to_core)?;
        decode_str(&resp.physical_id_json).map_err(transport_to_core)
    }

    async fn destroy_group(&self, group: &PhysicalId) -> CoreResult<()> {
        let req = PhysicalIdRequest {
            physical_id_json: encode_str(group).map_err(transport_to_core)?,
        };
        self.call_with_retry(|| {
            let req = req.clone();
            async move {
                let mut client = self.client().await?;
                let resp = client.destroy_group(req).await?.into_inner();
                Self::status_ok(resp.ok, resp.error_message, resp.retryable)
            }
        })
        .await
        .map_err(transport_to_core)
    }

    async fn bind(&self, src: &PhysicalId, dst: &PhysicalId) -> CoreResult<()> {
        let req = BindRequest {
            src_physical_id_json: encode_str(src).map_err(transport_to_core)?,
            dst_physical_id_json: encode_str(dst).map_err(transport_to_core)?,
        };
        self.call_with_retry(|| {
            let req = req.clone();
            async move {
                let mut client = self.client().await?;
                let resp = client.bind(req).await?.into_inner();
                Self::status_ok(resp.ok, resp.error_message, resp.retryable)
            }
        })
        .await
        .map_err(transport_to_core)
    }

    async fn unbind(&self, src: &PhysicalId, dst: &PhysicalId) -> CoreResult<()> {
        let req = BindRequest {
            src_physical_id_json: encode_str(src).map_err(transport_to_core)?,
            dst_physical_id_json: encode_str(dst).map_err(transport_to_core)?,
        };
        self.call_with_retry(|| {
            let req = req.clone();
            async move {
                let mut client = self.client().await?;
                let resp = client.unbind(req).await?.into_inner();
                Self::status_ok(resp.ok, resp.error_message, resp.retryable)
            }
        })
        .await
        .map_err(transport_to_core)
    }

    async fn reroute(&self, src: &PhysicalId, old_dst: &PhysicalId, new_dst: &PhysicalId) -> CoreResult<()> {
        let req = RerouteRequest {
            src_physical_id_json: encode_str(src).map_err(transport_to_core)?,
            old_dst_physical_id_json: encode_str(old_dst).map_err(transport_to_core)?,
            new_dst_physical_id_json: encode_str(new_dst).map_err(transport_to_core)?,
        };
        self.call_with_retry(|| {
            let req = req.clone();
            async move {
                let mut client = self.client().await?;
                let resp = client.reroute(req).await?.into_inner();
                Self::status_ok(resp.ok, resp.error_message, resp.retryable)
            }
        })
        .await
        .map_err(transport_to_core)
    }
}

#[async_trait]
impl RemoteDeployer for DeployTransportClient {
    async fn deploy_dev_maintenance_cfg(&self, node_id: &str, cfg: &DevMaintenanceCfg) -> CoreResult<()> {
        let req = MaintenanceCfgRequest {
            node_id: node_id.to_string(),
            log_options: cfg.log_options.clone(),
            dump_options: cfg.dump_options.clone(),
            profiling_options: cfg.profiling_options.clone(),
        };
        let mut client = self.client().await.map_err(transport_to_core)?;
        let resp = client
            .deploy_dev_maintenance_cfg(req)
            .await
            .map_err(Error::from)
            .map_err(transport_to_core)?
            .into_inner();
        Self::status_ok(resp.ok, resp.error_message, resp.retryable).map_err(transport_to_core)
    }

    async fn transfer_artifacts(&self, node_id: &str, plan: &DeployPlan) -> CoreResult<()> {
        let req = TransferArtifactsRequest {
            node_id: node_id.to_string(),
            deploy_plan_json: encode(plan).map_err(transport_to_core)?,
        };
        let mut client = self.client().await.map_err(transport_to_core)?;
        let resp = client
            .transfer_artifacts(req)
            .await
            .map_err(Error::from)
            .map_err(transport_to_core)?
            .into_inner();
        Self::status_ok(resp.ok, resp.error_message, resp.retryable).map_err(transport_to_core)
    }

    async fn load_submodels(&self, node_id: &str, batch: Vec<BatchLoadEntry>) -> CoreResult<()> {
        let req = LoadSubmodelsRequest {
            node_id: node_id.to_string(),
            batch_json: encode(&batch).map_err(transport_to_core)?,
        };
        let mut client = self.client().await.map_err(transport_to_core)?;
        let resp = client.load_submodels(req).await.map_err(Error::from).map_err(transport_to_core)?.into_inner();
        Self::status_ok(resp.ok, resp.error_message, resp.retryable).map_err(transport_to_core)
    }

    async fn undeploy(&self, node_id: &str) -> CoreResult<()> {
        let req = UndeployRequest {
            node_id: node_id.to_string(),
        };
        self.call_with_retry(|| {
            let req = req.clone();
            async move {
                let mut client = self.client().await?;
                let resp = client.undeploy(req).await?.into_inner();
                Self::status_ok(resp.ok, resp.error_message, resp.retryable)
            }
        })
        .await
        .map_err(transport_to_core)
    }
}

/// `GatewayClient`/`RemoteDeployer` are defined in `hetero-deploy` and
/// return `hetero_deploy::Result`; this crate's own `Error` carries
/// richer transport context, so we fold it down at the trait boundary.
fn transport_to_core(err: Error) -> hetero_deploy::Error {
    match err {
        Error::Remote(core_err) => core_err,
        Error::Timeout(d) => hetero_deploy::Error::Timeout(d),
        other => {
            debug!(error = %other, "transport error folded into core Error::Transport");
            hetero_deploy::Error::Transport(other.to_string())
        }
    }
}

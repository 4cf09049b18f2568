//! Server-side `DeployTransport` implementation.
//!
//! [`DeployTransportServer`] is a thin `tonic` service that decodes
//! every request's JSON payload into the matching `hetero-deploy`
//! domain type and dispatches to a node-local [`DeployTransportHandler`],
//! then re-encodes the handler's result as a `StatusResponse` (or the
//! richer per-RPC response message). The handler is where an actual
//! node agent binary plugs in its `DeployContext`, `ExchangeRouteEngine`,
//! and `ExecutorManager`; this crate only owns wire marshaling.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use hetero_deploy::device::DeviceInfo;
use hetero_deploy::error::Result as CoreResult;
use hetero_deploy::executor::BatchLoadEntry;
use hetero_deploy::exchange::PhysicalId;
use hetero_deploy::orchestrator::DevMaintenanceCfg;
use hetero_deploy::plan::DeployPlan;
use hetero_deploy::route::EndpointDesc;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info};

use crate::codec::{decode, decode_str, encode_str};
use crate::file_transport::{destination_path, FileReceiver};
use crate::proto::deploy_transport_server::DeployTransport;
use crate::proto::{
    BindRequest, CreateEndpointRequest, CreateGroupRequest, DataFlowExceptionRequest, FileChunk,
    FileTransferResponse, HealthRequest, HealthResponse, HeartbeatRequest, HeartbeatResponse,
    LoadSubmodelsRequest, MaintenanceCfgPullRequest, MaintenanceCfgRequest, MaintenanceCfgResponse,
    PhysicalIdRequest, PhysicalIdResponse, RerouteRequest, StatusResponse,
    TransferArtifactsRequest, UndeployRequest,
};

/// What this node reported on one heartbeat poll: the abnormal-device
/// and abnormal-submodel-instance sets, reported in full every round
/// (DESIGN.md resolves spec.md's "full set vs delta" open question in
/// favor of the full set).
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReport {
    /// Devices this node currently observes as unhealthy.
    pub abnormal_devices: Vec<DeviceInfo>,
    /// Submodel instance names this node currently observes as
    /// abnormal (dead executor, crashed subprocess).
    pub abnormal_submodel_instance_names: Vec<String>,
}

/// Node-local dispatch target for every `DeployTransport` RPC. A
/// concrete node agent binary implements this over its own
/// `DeployContext`, `ExchangeRouteEngine`, `ExecutorManager`, and
/// `SubprocessManager`.
#[async_trait]
pub trait DeployTransportHandler: Send + Sync {
    /// Push maintenance config ahead of artifact transfer.
    async fn deploy_dev_maintenance_cfg(&self, node_id: &str, cfg: &DevMaintenanceCfg) -> CoreResult<()>;

    /// Read back this node's current maintenance config (used by a
    /// freshly (re)joined deployer to pull config rather than wait for
    /// a push).
    async fn download_dev_maintenance_cfg(&self, node_id: &str) -> CoreResult<DevMaintenanceCfg>;

    /// Install the node-local slice of a transferred `DeployPlan`.
    async fn transfer_artifacts(&self, node_id: &str, plan: &DeployPlan) -> CoreResult<()>;

    /// Fan out a batch load to this node's executors.
    async fn load_submodels(&self, node_id: &str, batch: Vec<BatchLoadEntry>) -> CoreResult<()>;

    /// Undeploy (compensating or final) for this node.
    async fn undeploy(&self, node_id: &str) -> CoreResult<()>;

    /// Create a queue/tag/ref-queue/group endpoint on this node.
    async fn create_endpoint(&self, endpoint: &EndpointDesc) -> CoreResult<PhysicalId>;

    /// Destroy a previously created endpoint.
    async fn destroy_endpoint(&self, physical_id: &PhysicalId) -> CoreResult<()>;

    /// Create a group over the given member physical ids.
    async fn create_group(&self, members: &[PhysicalId]) -> CoreResult<PhysicalId>;

    /// Destroy a previously created group.
    async fn destroy_group(&self, group: &PhysicalId) -> CoreResult<()>;

    /// Bind a producer endpoint to a consumer endpoint.
    async fn bind(&self, src: &PhysicalId, dst: &PhysicalId) -> CoreResult<()>;

    /// Unbind a previously bound pair.
    async fn unbind(&self, src: &PhysicalId, dst: &PhysicalId) -> CoreResult<()>;

    /// Reroute a binding to a new destination.
    async fn reroute(&self, src: &PhysicalId, old_dst: &PhysicalId, new_dst: &PhysicalId) -> CoreResult<()>;

    /// Forward a `DataFlowException` from an executor to the local
    /// handler (wakes a pending `Fetch` for the reserved model-IO
    /// scope; fans out to a scoped subscriber otherwise).
    async fn notify_data_flow_exception(&self, trans_id: u64, scope: &str, code: i32, context: &[u8]) -> CoreResult<()>;

    /// Answer one heartbeat poll for this node.
    async fn heartbeat(&self, node_id: &str, sequence: u64) -> CoreResult<HeartbeatReport>;

    /// Base directory chunked file transfers are written under; the
    /// server resolves `<base_dir>/<session>/<root_model>/<relative>`
    /// per spec.md §6's filesystem layout.
    fn base_dir(&self) -> &std::path::Path;
}

/// Wraps a [`DeployTransportHandler`] as the generated `DeployTransport`
/// gRPC service.
pub struct DeployTransportServer<H> {
    handler: std::sync::Arc<H>,
}

impl<H: DeployTransportHandler> DeployTransportServer<H> {
    /// Construct a server dispatching to the given handler.
    #[must_use]
    pub fn new(handler: std::sync::Arc<H>) -> Self {
        Self { handler }
    }
}

fn status_response(result: CoreResult<()>) -> Response<StatusResponse> {
    match result {
        Ok(()) => Response::new(StatusResponse {
            ok: true,
            error_message: String::new(),
            retryable: false,
        }),
        Err(err) => {
            let retryable = err.is_retryable();
            error!(error = %err, retryable, "DeployTransport RPC failed");
            Response::new(StatusResponse {
                ok: false,
                error_message: err.to_string(),
                retryable,
            })
        }
    }
}

fn physical_id_response(result: CoreResult<PhysicalId>) -> Response<PhysicalIdResponse> {
    match result.and_then(|id| encode_str(&id).map_err(|e| hetero_deploy::Error::Serialization(e.to_string()))) {
        Ok(physical_id_json) => Response::new(PhysicalIdResponse {
            ok: true,
            error_message: String::new(),
            retryable: false,
            physical_id_json,
        }),
        Err(err) => {
            let retryable = err.is_retryable();
            Response::new(PhysicalIdResponse {
                ok: false,
                error_message: err.to_string(),
                retryable,
                physical_id_json: String::new(),
            })
        }
    }
}

type FileTransferStream = Pin<Box<dyn Stream<Item = Result<FileChunk, Status>> + Send>>;

#[async_trait]
impl<H: DeployTransportHandler + 'static> DeployTransport for DeployTransportServer<H> {
    async fn deploy_dev_maintenance_cfg(&self, request: Request<MaintenanceCfgRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let cfg = DevMaintenanceCfg {
            log_options: req.log_options,
            dump_options: req.dump_options,
            profiling_options: req.profiling_options,
        };
        Ok(status_response(self.handler.deploy_dev_maintenance_cfg(&req.node_id, &cfg).await))
    }

    async fn download_dev_maintenance_cfg(
        &self,
        request: Request<MaintenanceCfgPullRequest>,
    ) -> Result<Response<MaintenanceCfgResponse>, Status> {
        let req = request.into_inner();
        let resp = match self.handler.download_dev_maintenance_cfg(&req.node_id).await {
            Ok(cfg) => MaintenanceCfgResponse {
                ok: true,
                error_message: String::new(),
                retryable: false,
                log_options: cfg.log_options,
                dump_options: cfg.dump_options,
                profiling_options: cfg.profiling_options,
            },
            Err(err) => MaintenanceCfgResponse {
                ok: false,
                error_message: err.to_string(),
                retryable: err.is_retryable(),
                log_options: String::new(),
                dump_options: String::new(),
                profiling_options: String::new(),
            },
        };
        Ok(Response::new(resp))
    }

    async fn transfer_artifacts(&self, request: Request<TransferArtifactsRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = decode::<DeployPlan>(&req.deploy_plan_json)
            .map_err(|e| hetero_deploy::Error::Serialization(e.to_string()));
        let result = match result {
            Ok(plan) => self.handler.transfer_artifacts(&req.node_id, &plan).await,
            Err(err) => Err(err),
        };
        Ok(status_response(result))
    }

    async fn load_submodels(&self, request: Request<LoadSubmodelsRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = decode::<Vec<BatchLoadEntry>>(&req.batch_json)
            .map_err(|e| hetero_deploy::Error::Serialization(e.to_string()));
        let result = match result {
            Ok(batch) => self.handler.load_submodels(&req.node_id, batch).await,
            Err(err) => Err(err),
        };
        Ok(status_response(result))
    }

    async fn undeploy(&self, request: Request<UndeployRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        Ok(status_response(self.handler.undeploy(&req.node_id).await))
    }

    async fn create_endpoint(&self, request: Request<CreateEndpointRequest>) -> Result<Response<PhysicalIdResponse>, Status> {
        let req = request.into_inner();
        let result = decode::<EndpointDesc>(&req.endpoint_json)
            .map_err(|e| hetero_deploy::Error::Serialization(e.to_string()));
        let result = match result {
            Ok(endpoint) => self.handler.create_endpoint(&endpoint).await,
            Err(err) => Err(err),
        };
        Ok(physical_id_response(result))
    }

    async fn destroy_endpoint(&self, request: Request<PhysicalIdRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = decode_str::<PhysicalId>(&req.physical_id_json)
            .map_err(|e| hetero_deploy::Error::Serialization(e.to_string()));
        let result = match result {
            Ok(id) => self.handler.destroy_endpoint(&id).await,
            Err(err) => Err(err),
        };
        Ok(status_response(result))
    }

    async fn create_group(&self, request: Request<CreateGroupRequest>) -> Result<Response<PhysicalIdResponse>, Status> {
        let req = request.into_inner();
        let members: CoreResult<Vec<PhysicalId>> = req
            .member_physical_ids_json
            .iter()
            .map(|s| decode_str(s).map_err(|e| hetero_deploy::Error::Serialization(e.to_string())))
            .collect();
        let result = match members {
            Ok(members) => self.handler.create_group(&members).await,
            Err(err) => Err(err),
        };
        Ok(physical_id_response(result))
    }

    async fn destroy_group(&self, request: Request<PhysicalIdRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = decode_str::<PhysicalId>(&req.physical_id_json)
            .map_err(|e| hetero_deploy::Error::Serialization(e.to_string()));
        let result = match result {
            Ok(id) => self.handler.destroy_group(&id).await,
            Err(err) => Err(err),
        };
        Ok(status_response(result))
    }

    async fn bind(&self, request: Request<BindRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let parsed = parse_pair(&req.src_physical_id_json, &req.dst_physical_id_json);
        let result = match parsed {
            Ok((src, dst)) => self.handler.bind(&src, &dst).await,
            Err(err) => Err(err),
        };
        Ok(status_response(result))
    }

    async fn unbind(&self, request: Request<BindRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let parsed = parse_pair(&req.src_physical_id_json, &req.dst_physical_id_json);
        let result = match parsed {
            Ok((src, dst)) => self.handler.unbind(&src, &dst).await,
            Err(err) => Err(err),
        };
        Ok(status_response(result))
    }

    async fn reroute(&self, request: Request<RerouteRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = parse_triple(&req.src_physical_id_json, &req.old_dst_physical_id_json, &req.new_dst_physical_id_json);
        let result = match result {
            Ok((src, old_dst, new_dst)) => self.handler.reroute(&src, &old_dst, &new_dst).await,
            Err(err) => Err(err),
        };
        Ok(status_response(result))
    }

    async fn notify_data_flow_exception(
        &self,
        request: Request<DataFlowExceptionRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .handler
            .notify_data_flow_exception(req.trans_id, &req.scope, req.code, &req.context)
            .await;
        Ok(status_response(result))
    }

    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let resp = match self.handler.heartbeat(&req.node_id, req.sequence).await {
            Ok(report) => {
                let abnormal_devices_json: Vec<String> = report
                    .abnormal_devices
                    .iter()
                    .map(encode_str)
                    .collect::<Result<_, _>>()
                    .unwrap_or_default();
                HeartbeatResponse {
                    ok: true,
                    error_message: String::new(),
                    retryable: false,
                    abnormal_devices_json,
                    abnormal_submodel_instance_names: report.abnormal_submodel_instance_names,
                }
            }
            Err(err) => HeartbeatResponse {
                ok: false,
                error_message: err.to_string(),
                retryable: err.is_retryable(),
                abnormal_devices_json: Vec::new(),
                abnormal_submodel_instance_names: Vec::new(),
            },
        };
        Ok(Response::new(resp))
    }

    type TransferFileStream = FileTransferStream;

    async fn transfer_file(&self, request: Request<Streaming<FileChunk>>) -> Result<Response<FileTransferResponse>, Status> {
        let mut stream = request.into_inner();
        let mut receiver: Option<FileReceiver> = None;
        let mut total_written: u64 = 0;
        let mut final_path: Option<PathBuf> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if receiver.is_none() {
                let path = destination_path(self.handler.base_dir(), &chunk.session_id, &chunk.root_model, &chunk.relative_path)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
                final_path = Some(path.clone());
                receiver = Some(FileReceiver::create(path).await.map_err(|e| Status::internal(e.to_string()))?);
            }
            total_written = receiver
                .as_mut()
                .expect("receiver initialized above")
                .accept(&chunk)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
        }

        info!(path = ?final_path, bytes = total_written, "file transfer complete");
        Ok(Response::new(FileTransferResponse {
            ok: true,
            error_message: String::new(),
            bytes_written: total_written,
        }))
    }

    async fn health(&self, request: Request<HealthRequest>) -> Result<Response<HealthResponse>, Status> {
        let req = request.into_inner();
        info!(service = %req.service, "health check");
        Ok(Response::new(HealthResponse {
            status: crate::proto::health_response::HealthStatus::Serving as i32,
            message: String::new(),
        }))
    }
}

fn parse_pair(src_json: &str, dst_json: &str) -> CoreResult<(PhysicalId, PhysicalId)> {
    let src = decode_str(src_json).map_err(|e: crate::error::Error| hetero_deploy::Error::Serialization(e.to_string()))?;
    let dst = decode_str(dst_json).map_err(|e: crate::error::Error| hetero_deploy::Error::Serialization(e.to_string()))?;
    Ok((src, dst))
}

fn parse_triple(src_json: &str, old_json: &str, new_json: &str) -> CoreResult<(PhysicalId, PhysicalId, PhysicalId)> {
    let src = decode_str(src_json).map_err(|e: crate::error::Error| hetero_deploy::Error::Serialization(e.to_string()))?;
    let old_dst = decode_str(old_json).map_err(|e: crate::error::Error| hetero_deploy::Error::Serialization(e.to_string()))?;
    let new_dst = decode_str(new_json).map_err(|e: crate::error::Error| hetero_deploy::Error::Serialization(e.to_string()))?;
    Ok((src, old_dst, new_dst))
}

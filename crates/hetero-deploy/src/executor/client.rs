//! [`ExecutorClient`] contract and the `BatchLoadModel` parse-parallel,
//! load-serial orchestration.

use crate::error::Result;
use crate::route::QueueAttrs;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// `ClearModelRunningData` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearKind {
    /// Quiesce running models; no new kernels launched.
    Stop,
    /// Drop queued traffic and per-model transient state.
    Clear,
}

/// One submodel entry within a `BatchLoadModel` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLoadEntry {
    /// Submodel name.
    pub submodel_name: String,
    /// Engine the submodel runs on.
    pub engine: crate::model::Engine,
    /// Path on the deployer-local filesystem.
    pub path: String,
    /// Input queue attributes, as resolved by the exchange route engine,
    /// in declared input-port order.
    pub input_queue_attrs: Vec<QueueAttrs>,
    /// Output queue attributes, in declared output-port order.
    pub output_queue_attrs: Vec<QueueAttrs>,
    /// Fusion offsets for inputs packed onto a shared queue.
    pub input_fusion_offsets: Vec<u32>,
    /// `invoked-model name -> queue id` mappings for UDF-invoked models.
    pub invoked_model_queue_mappings: std::collections::HashMap<String, u64>,
    /// Declared replica count.
    pub replica_info: u32,
    /// Whether this submodel is eligible for dynamic-sched routing.
    pub dynamic_sched: bool,
    /// Model-uuid used by the gateway.
    pub model_uuid: String,
}

/// Request envelope sent by an `ExecutorClient` to its executor
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutorRequest {
    /// Pre-process step before load (resource reservation).
    PreProcess,
    /// Load a single model.
    LoadModel(BatchLoadEntry),
    /// Load a batch of models in one request.
    BatchLoadModel(Vec<BatchLoadEntry>),
    /// Unload a previously loaded submodel.
    UnloadModel { submodel_name: String },
    /// Stop or clear running data for a submodel.
    ClearModelRunningData {
        submodel_name: String,
        kind: ClearKind,
    },
    /// Forward a data-flow exception notification.
    DataFlowExceptionNotify {
        trans_id: u64,
        scope: String,
        code: i32,
    },
    /// Request profiling info collected since the last call.
    UpdateProfilingFromExecutor,
    /// Push a var manager sync for shared device memory.
    SyncVarManager { session_id: String, device_id: u32 },
    /// Liveness probe.
    GetSubProcStat,
}

/// Response envelope returned by an executor process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResponse {
    /// Zero on success; non-zero error codes mirror the taxonomy's
    /// `error_code`/`error_message` pair.
    pub error_code: i32,
    /// Human-readable error message, empty on success.
    pub error_message: String,
}

impl ExecutorResponse {
    /// Construct a success response.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            error_code: 0,
            error_message: String::new(),
        }
    }

    /// Whether this response indicates success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

/// The client side of one executor process: one request queue, one
/// response queue at well-known ids. Implementations live in
/// `hetero-deploy-transport` (gRPC-backed) or in test fixtures
/// (in-memory).
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// The `ExecutorKey` this client addresses.
    fn key(&self) -> &crate::executor::key::ExecutorKey;

    /// Send a request and await the executor's response.
    async fn send(&self, request: ExecutorRequest) -> Result<ExecutorResponse>;

    /// Poll liveness, bridging into `SubprocessManager` events.
    async fn get_sub_proc_stat(&self) -> Result<ExecutorResponse> {
        self.send(ExecutorRequest::GetSubProcStat).await
    }
}

/// Parse all entries in `batch` in parallel (thread pool sized to
/// `parse_pool_max`, never unbounded), then load each serially in the
/// given order so that shared resources (rank table, var memory) are
/// touched in a defined order.
///
/// `parse` runs off the async runtime (CPU-bound) via `rayon`; `load`
/// runs the provided async load step for each entry, strictly in
/// sequence.
pub async fn batch_load_model<P, L, Fut>(
    client: &dyn ExecutorClient,
    batch: Vec<BatchLoadEntry>,
    parse_pool_max: usize,
    parse: P,
    load: L,
) -> Result<Vec<ExecutorResponse>>
where
    P: Fn(&BatchLoadEntry) -> Result<()> + Send + Sync,
    L: Fn(BatchLoadEntry) -> Fut,
    Fut: std::future::Future<Output = Result<ExecutorResponse>>,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parse_pool_max.max(1).min(crate::constants::BATCH_LOAD_PARSE_POOL_MAX))
        .build()
        .map_err(|e| crate::error::Error::Subprocess(format!("rayon pool build failed: {e}")))?;

    let parse_results: Vec<Result<()>> = pool.install(|| {
        use rayon::prelude::*;
        batch.par_iter().map(&parse).collect()
    });
    for result in parse_results {
        result?;
    }

    let mut responses = Vec::with_capacity(batch.len());
    for entry in batch {
        let response = load(entry).await?;
        if !response.is_ok() {
            return Err(crate::error::Error::DeployFailed {
                step: "BatchLoadModel",
                reason: response.error_message,
            });
        }
        responses.push(response);
    }

    let _ = client.key();
    Ok(responses)
}

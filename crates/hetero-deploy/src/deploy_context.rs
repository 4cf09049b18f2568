//! [`DeployContext`]: per-session state for one deployed flow model —
//! loaded submodel placements, realized exchange routes, var managers,
//! transfer queues, and heartbeat bookkeeping.
//!
//! A single mutex (`mu_` in the corpus's naming) protects the maps that
//! change together during deploy/undeploy; the heartbeat thread and the
//! abnormal status handler both read through this lock rather than
//! caching their own copies, so a snapshot is always consistent.

use crate::device::DeviceInfo;
use crate::error::Result;
use crate::exchange::ExchangeRoute;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Shared device memory for one `(device_id, session_id)` pair, usable
/// by every model deployed in that session on that device.
/// Reference-counted: the last model to unload a submodel referencing
/// this region drops the count to zero and the region is released.
pub struct VarManager {
    device: DeviceInfo,
    session_id: String,
    bytes: u64,
    ref_count: std::sync::atomic::AtomicUsize,
}

impl VarManager {
    fn new(device: DeviceInfo, session_id: String, bytes: u64) -> Self {
        Self {
            device,
            session_id,
            bytes,
            ref_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Device this shared region lives on.
    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Session this shared region belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Reserved byte size of the shared region.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Increment the reference count (a model starts using this region).
    pub fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the reference count, returning the count after release.
    pub fn release(&self) -> usize {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }
}

/// Handle for a per-device content-sharing transfer queue (depth 128,
/// pull mode per the file-transport contract): moves mbuf payloads onto
/// device memory before handing them to the device's `VarManager`.
#[derive(Debug, Clone)]
pub struct TransferQueueHandle {
    /// Device this queue lives on.
    pub device: DeviceInfo,
    /// Configured queue depth.
    pub depth: usize,
    /// Opaque queue id resolved at creation, if already materialized.
    pub queue_id: Option<u64>,
}

#[derive(Default)]
struct Tables {
    submodel_devices: HashMap<String, DeviceInfo>,
    submodel_routes: HashMap<String, ExchangeRoute>,
    var_managers: HashMap<(DeviceInfo, String), Arc<VarManager>>,
    transfer_queues: HashMap<DeviceInfo, TransferQueueHandle>,
    deployed_node_ids: HashSet<String>,
}

/// Per-session state: loaded submodel placements, realized exchange
/// routes (one per node), shared var managers, transfer queues, and
/// deploy bookkeeping. Lives from `DeployModel` to `Undeploy`.
pub struct DeployContext {
    session_name: String,
    context_id: String,
    tables: Mutex<Tables>,
    running: Arc<AtomicBool>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeployContext {
    /// Construct a new, empty deploy context for a session.
    #[must_use]
    pub fn new(session_name: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            context_id: context_id.into(),
            tables: Mutex::new(Tables::default()),
            running: Arc::new(AtomicBool::new(true)),
            heartbeat_thread: Mutex::new(None),
        }
    }

    /// Session name this context was created for.
    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Deploy session context id (used as part of `ExecutorKey`).
    #[must_use]
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Record a submodel's assigned device.
    pub fn set_submodel_device(&self, submodel: impl Into<String>, device: DeviceInfo) {
        self.tables.lock().submodel_devices.insert(submodel.into(), device);
    }

    /// Look up a submodel's assigned device.
    #[must_use]
    pub fn submodel_device(&self, submodel: &str) -> Option<DeviceInfo> {
        self.tables.lock().submodel_devices.get(submodel).cloned()
    }

    /// Store the realized `ExchangeRoute` for a node. `DeployContext` is
    /// the sole owner of every `ExchangeRoute` it holds; undeploy drops
    /// them after the exchange route engine's teardown has run.
    pub fn set_route(&self, node_id: impl Into<String>, route: ExchangeRoute) {
        self.tables.lock().submodel_routes.insert(node_id.into(), route);
    }

    /// Take ownership of a node's route for teardown (removes it from
    /// the context).
    pub fn take_route(&self, node_id: &str) -> Option<ExchangeRoute> {
        self.tables.lock().submodel_routes.remove(node_id)
    }

    /// Number of nodes with a live route.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.tables.lock().submodel_routes.len()
    }

    /// Record that a node's load succeeded (data model invariant: a
    /// node is in `deployed_node_ids` exactly when its load succeeded).
    pub fn mark_node_deployed(&self, node_id: impl Into<String>) {
        self.tables.lock().deployed_node_ids.insert(node_id.into());
    }

    /// Remove a node from the deployed set (used by the orchestrator's
    /// compensating undeploy bookkeeping).
    pub fn unmark_node_deployed(&self, node_id: &str) {
        self.tables.lock().deployed_node_ids.remove(node_id);
    }

    /// Snapshot of node ids currently recorded as deployed.
    #[must_use]
    pub fn deployed_node_ids(&self) -> HashSet<String> {
        self.tables.lock().deployed_node_ids.clone()
    }

    /// Get or create the shared var manager for `(device, session_id)`,
    /// reserving `bytes` on first creation. Subsequent calls with a
    /// different `bytes` value do not resize; callers needing a larger
    /// region must coordinate a fresh session.
    pub fn get_or_create_var_manager(&self, device: DeviceInfo, session_id: impl Into<String>, bytes: u64) -> Arc<VarManager> {
        let session_id = session_id.into();
        let key = (device.clone(), session_id.clone());
        let mut tables = self.tables.lock();
        tables
            .var_managers
            .entry(key)
            .or_insert_with(|| Arc::new(VarManager::new(device, session_id, bytes)))
            .clone()
    }

    /// Register a transfer queue handle for a device.
    pub fn set_transfer_queue(&self, device: DeviceInfo, handle: TransferQueueHandle) {
        self.tables.lock().transfer_queues.insert(device, handle);
    }

    /// Look up a device's transfer queue handle.
    #[must_use]
    pub fn transfer_queue(&self, device: &DeviceInfo) -> Option<TransferQueueHandle> {
        self.tables.lock().transfer_queues.get(device).cloned()
    }

    /// Start the per-context heartbeat background thread: invokes
    /// `poll` at `interval`, forwarding the `DeviceStateList` delta it
    /// returns to `on_report`. Named `ge_dpl_heartbeat` for diagnostics,
    /// per the corpus's background-thread naming convention.
    pub fn start_heartbeat<P, R>(&self, interval: Duration, poll: P, mut on_report: R)
    where
        P: Fn() -> Result<crate::device::DeviceStateList> + Send + 'static,
        R: FnMut(crate::device::DeviceStateList) + Send + 'static,
    {
        let running = self.running.clone();
        let session_name = self.session_name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}_heartbeat", crate::constants::THREAD_NAME_PREFIX))
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match poll() {
                        Ok(states) => on_report(states),
                        Err(err) => debug!(session = %session_name, error = %err, "heartbeat poll failed"),
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("spawning the heartbeat thread must succeed");
        *self.heartbeat_thread.lock() = Some(handle);
    }

    /// Stop the heartbeat thread, join it, and clear all per-session
    /// tables. Called once the `ExchangeRoute`s it owned have been torn
    /// down by the exchange route engine.
    pub fn finalize(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat_thread.lock().take() {
            let _ = handle.join();
        }
        let mut tables = self.tables.lock();
        *tables = Tables::default();
        info!(session = %self.session_name, "deploy context finalized");
    }
}

impl Drop for DeployContext {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;

    fn device() -> DeviceInfo {
        DeviceInfo::new(DeviceType::Npu, "node-0", 0)
    }

    #[test]
    fn var_manager_is_shared_across_models_on_same_device_session() {
        let ctx = DeployContext::new("session-a", "ctx-0");
        let a = ctx.get_or_create_var_manager(device(), "session-a", 4096);
        let b = ctx.get_or_create_var_manager(device(), "session-a", 4096);
        assert!(Arc::ptr_eq(&a, &b));
        a.acquire();
        b.acquire();
        assert_eq!(a.ref_count(), 2);
    }

    #[test]
    fn deployed_node_ids_tracks_load_success() {
        let ctx = DeployContext::new("session-a", "ctx-0");
        ctx.mark_node_deployed("node-0");
        ctx.mark_node_deployed("node-1");
        assert_eq!(ctx.deployed_node_ids().len(), 2);
        ctx.unmark_node_deployed("node-0");
        assert_eq!(ctx.deployed_node_ids(), HashSet::from(["node-1".to_string()]));
    }

    #[test]
    fn route_storage_round_trips() {
        let ctx = DeployContext::new("session-a", "ctx-0");
        ctx.set_route("node-0", ExchangeRoute::new("node-0"));
        assert_eq!(ctx.route_count(), 1);
        let route = ctx.take_route("node-0").unwrap();
        assert_eq!(route.node_id, "node-0");
        assert_eq!(ctx.route_count(), 0);
    }

    #[test]
    fn heartbeat_thread_invokes_callback_and_stops_on_finalize() {
        let ctx = DeployContext::new("session-a", "ctx-0");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        ctx.start_heartbeat(
            Duration::from_millis(5),
            || Ok(crate::device::DeviceStateList::new()),
            move |_states| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(calls.load(Ordering::SeqCst) > 0);
        ctx.finalize();
    }
}

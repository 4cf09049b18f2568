//! [`AbnormalStatusHandler`]: watches the resource-config file and
//! per-session heartbeats, classifies device/process loss, and drives
//! redeploy / dynamic-sched degrade / abort per root model.

use crate::device::{DeviceInfo, DeviceStateList};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a root model's abnormal instances were classified, per the
/// decision procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The master server's own host failed; nothing can be done short
    /// of an external restart.
    NotSupportRedeploy,
    /// A dynamic-sched model lost device id 0 of the master.
    NotSupportDynamicSched,
    /// Any other device/process loss.
    NotSupportDefault,
}

/// Tagged callback event dispatched to a root model's registered
/// handler. Represented as a single enum rather than virtual dispatch,
/// per the corpus's callback convention: the receiver decides behavior
/// by tag.
#[derive(Debug, Clone)]
pub enum AbnormalEvent {
    /// A redeploy (or dynamic-sched degrade) is starting for this root
    /// model.
    RedeployStart { root_model: String, class: FailureClass },
    /// The model continues with a reduced replica set after clearing
    /// exception data on every node that touched it.
    DynamicSched { root_model: String, surviving_devices: Vec<DeviceInfo> },
    /// Neither redeploy nor dynamic-sched degrade was possible; pending
    /// feed/fetch calls should observe `Redeploying`/`Subhealthy`.
    FailedHandleAbnormal { root_model: String, class: FailureClass },
}

/// One root model's placement, as needed to decide dynamic-sched
/// recoverability and to dispatch `ClearModelExceptionData`.
#[derive(Debug, Clone, Default)]
pub struct RootModelPlacement {
    /// Every device any instance of this model was placed on.
    pub devices: Vec<DeviceInfo>,
    /// Whether this model supports dynamic-sched recovery at all
    /// (declared at deploy time; independent of current health).
    pub dynamic_sched_capable: bool,
    /// Devices backing the master's rank-0 instance, if any. Losing
    /// device id 0 here (while the master's host stays up) is the
    /// `NotSupportDynamicSched` trigger.
    pub master_rank0_devices: Vec<DeviceInfo>,
    /// Node id hosting the master server process itself, if known.
    /// Losing this host is `NotSupportRedeploy` unconditionally, even
    /// for a dynamic-sched-capable model: a dead host takes every
    /// device on it, not just rank-0.
    pub master_host: Option<String>,
}

/// Collaborator queried for the current abnormal-device/abnormal-pid
/// snapshot across every remote deployer. Implementations live in
/// `hetero-deploy-transport` (RPC-backed) or test fixtures (in-memory).
pub trait HeartbeatSource: Send + Sync {
    /// Poll every remote deployer for its current device/process health.
    fn poll(&self) -> Result<DeviceStateList>;
}

/// Per-root-model deploy-in-flight guard, consulted so the handler
/// never races a redeploy against an in-progress `DeployModel`/
/// `Undeploy` (Invariant 6 in the testable-properties section).
pub trait DeployGuard: Send + Sync {
    /// Whether a deploy/undeploy is currently in flight for this root
    /// model.
    fn is_deploying(&self, root_model: &str) -> bool;
}

/// Clears exception data on every node that ever touched a model,
/// `STOP` then `CLEAR`, ahead of a dynamic-sched degrade.
pub trait ExceptionDataClearer: Send + Sync {
    /// Stop then clear running data on every given device.
    fn clear(&self, root_model: &str, devices: &[DeviceInfo]) -> Result<()>;
}

struct Tables {
    baseline: DeviceStateList,
    placements: HashMap<String, RootModelPlacement>,
}

/// Shared state behind the handler's public handle: every collaborator
/// it dispatches through, plus the mutable tables a background thread
/// and the public `handle_state_update` entry point both touch.
struct Inner {
    resource_config_path: PathBuf,
    heartbeat_source: Arc<dyn HeartbeatSource>,
    deploy_guard: Arc<dyn DeployGuard>,
    clearer: Arc<dyn ExceptionDataClearer>,
    on_event: Arc<dyn Fn(AbnormalEvent) + Send + Sync>,
    redeploy_pool_bound: usize,
    tables: Mutex<Tables>,
    running: AtomicBool,
    #[cfg(feature = "observability")]
    metrics: Option<Arc<hetero_deploy_observability::DeployMetrics>>,
}

impl FailureClass {
    /// Prometheus label value for this classification, matching
    /// [`AbnormalEvent`]'s dispatch tags.
    fn metric_label(self) -> &'static str {
        match self {
            FailureClass::NotSupportRedeploy => "not_support_redeploy",
            FailureClass::NotSupportDynamicSched => "not_support_dynamic_sched",
            FailureClass::NotSupportDefault => "not_support_default",
        }
    }
}

impl Inner {
    fn handle_state_update(&self, updated: DeviceStateList) -> bool {
        let affected = {
            let mut tables = self.tables.lock();
            let new_abnormal = tables.baseline.new_abnormal_since(&updated);
            tables.baseline = updated;
            if new_abnormal.is_empty() {
                return true;
            }
            let abnormal_set: HashSet<DeviceInfo> = new_abnormal.into_iter().collect();
            tables
                .placements
                .iter()
                .filter(|(_, placement)| placement.devices.iter().any(|d| abnormal_set.contains(d)))
                .map(|(name, placement)| (name.clone(), placement.clone(), abnormal_set.clone()))
                .collect::<Vec<_>>()
        };

        if affected.is_empty() {
            return true;
        }

        info!(models = affected.len(), "dispatching abnormal status handling");

        // Wait until no deploy is in flight for any affected model
        // before classifying and dispatching (Invariant 6).
        for (root_model, _, _) in &affected {
            let deadline = Instant::now() + Duration::from_secs(30);
            while self.deploy_guard.is_deploying(root_model) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(affected.len().min(self.redeploy_pool_bound.max(1)))
            .build();
        let Ok(pool) = pool else {
            warn!("failed to build redeploy thread pool; handling serially");
            let mut all_ok = true;
            for (root_model, placement, abnormal) in &affected {
                if !self.handle_one(root_model, placement, abnormal) {
                    all_ok = false;
                }
            }
            return all_ok;
        };

        let results: Vec<bool> = pool.install(|| {
            use rayon::prelude::*;
            affected
                .par_iter()
                .map(|(root_model, placement, abnormal)| self.handle_one(root_model, placement, abnormal))
                .collect()
        });

        results.into_iter().all(|ok| ok)
    }

    /// Classify and dispatch events for one root model; returns whether
    /// the outcome was a successful redeploy/degrade (not a failed
    /// handle).
    fn handle_one(&self, root_model: &str, placement: &RootModelPlacement, abnormal: &HashSet<DeviceInfo>) -> bool {
        let class = classify(placement, abnormal);

        (self.on_event)(AbnormalEvent::RedeployStart {
            root_model: root_model.to_string(),
            class,
        });

        let surviving: Vec<DeviceInfo> = placement
            .devices
            .iter()
            .filter(|d| !abnormal.contains(*d))
            .cloned()
            .collect();
        let every_abnormal_has_sibling = placement.devices.iter().filter(|d| abnormal.contains(*d)).all(|failed| {
            placement
                .devices
                .iter()
                .any(|other| other != failed && !abnormal.contains(other))
        });

        if placement.dynamic_sched_capable && every_abnormal_has_sibling && !surviving.is_empty() {
            if let Err(err) = self.clearer.clear(root_model, &placement.devices) {
                warn!(root_model, error = %err, "ClearModelExceptionData failed, falling through to failed-handle");
                self.record_decision(class.metric_label());
                (self.on_event)(AbnormalEvent::FailedHandleAbnormal {
                    root_model: root_model.to_string(),
                    class,
                });
                return false;
            }
            self.record_decision("dynamic_sched");
            (self.on_event)(AbnormalEvent::DynamicSched {
                root_model: root_model.to_string(),
                surviving_devices: surviving,
            });
            true
        } else {
            self.record_decision(class.metric_label());
            (self.on_event)(AbnormalEvent::FailedHandleAbnormal {
                root_model: root_model.to_string(),
                class,
            });
            false
        }
    }

    #[cfg(feature = "observability")]
    fn record_decision(&self, classification: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_redeploy_decision(classification);
        }
    }

    #[cfg(not(feature = "observability"))]
    fn record_decision(&self, _classification: &str) {}
}

/// Watches the resource-config file (inotify) and a heartbeat source,
/// computes the abnormal-device delta, and dispatches `RedeployStart`/
/// `DynamicSched`/`FailedHandleAbnormal` events per affected root model.
pub struct AbnormalStatusHandler {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AbnormalStatusHandler {
    /// Construct a handler watching `resource_config_path`, polling
    /// `heartbeat_source`, guarded by `deploy_guard`, clearing exception
    /// data via `clearer`, and dispatching events to `on_event`.
    #[must_use]
    pub fn new(
        resource_config_path: impl Into<PathBuf>,
        heartbeat_source: Arc<dyn HeartbeatSource>,
        deploy_guard: Arc<dyn DeployGuard>,
        clearer: Arc<dyn ExceptionDataClearer>,
        on_event: impl Fn(AbnormalEvent) + Send + Sync + 'static,
        redeploy_pool_bound: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resource_config_path: resource_config_path.into(),
                heartbeat_source,
                deploy_guard,
                clearer,
                on_event: Arc::new(on_event),
                redeploy_pool_bound: redeploy_pool_bound.max(1),
                tables: Mutex::new(Tables {
                    baseline: DeviceStateList::new(),
                    placements: HashMap::new(),
                }),
                running: AtomicBool::new(true),
                #[cfg(feature = "observability")]
                metrics: None,
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Attach a [`hetero_deploy_observability::DeployMetrics`] instance
    /// that every subsequent redeploy/dynamic-sched/abort decision is
    /// recorded against, labeled by [`FailureClass`].
    #[cfg(feature = "observability")]
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<hetero_deploy_observability::DeployMetrics>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_metrics called before the handler is shared")
            .metrics = Some(metrics);
        self
    }

    /// Register (or replace) a root model's placement, consulted when
    /// an abnormal device is projected onto deployed model instances.
    pub fn register_placement(&self, root_model: impl Into<String>, placement: RootModelPlacement) {
        self.inner.tables.lock().placements.insert(root_model.into(), placement);
    }

    /// Drop a root model's placement (called on `Undeploy`).
    pub fn unregister_placement(&self, root_model: &str) {
        self.inner.tables.lock().placements.remove(root_model);
    }

    /// Start the heartbeat-driven polling thread, named
    /// `ge_dpl_heartbeat_watch` for diagnostics.
    pub fn start_heartbeat_watch(&self, interval: Duration) -> Result<()> {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}_heartbeat_watch", crate::constants::THREAD_NAME_PREFIX))
            .spawn(move || {
                while inner.running.load(Ordering::SeqCst) {
                    match inner.heartbeat_source.poll() {
                        Ok(updated) => {
                            inner.handle_state_update(updated);
                        }
                        Err(err) => debug!(error = %err, "heartbeat poll for abnormal status failed"),
                    }
                    std::thread::sleep(interval);
                }
            })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Start the resource-config file watcher thread, named
    /// `ge_dpl_cfg_watch`. On an `inotify` IN_MODIFY event, waits up to
    /// `REDEPLOY_SENTINEL_WAIT` for the `redeploy` sentinel file before
    /// evaluating.
    pub fn start_config_watch(&self) -> Result<()> {
        use notify::{RecursiveMode, Watcher};

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })
        .map_err(|e| crate::error::Error::Subprocess(format!("inotify watcher init failed: {e}")))?;

        let watch_dir = self
            .inner
            .resource_config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| crate::error::Error::Subprocess(format!("inotify watch failed: {e}")))?;

        let inner = self.inner.clone();
        let sentinel_path = watch_dir.join(crate::constants::SENTINEL_REDEPLOY);
        let done_path = watch_dir.join(crate::constants::SENTINEL_REDEPLOY_DONE);
        let error_path = watch_dir.join(crate::constants::SENTINEL_REDEPLOY_ERROR);

        let handle = std::thread::Builder::new()
            .name(format!("{}_cfg_watch", crate::constants::THREAD_NAME_PREFIX))
            .spawn(move || {
                // Keep the watcher alive for the thread's lifetime.
                let _watcher = watcher;
                while inner.running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(Ok(event)) => {
                            if !matches!(event.kind, notify::EventKind::Modify(_)) {
                                continue;
                            }
                            if !wait_for_sentinel(&sentinel_path) {
                                debug!("resource-config modified but no redeploy sentinel appeared");
                                continue;
                            }
                            let _ = std::fs::remove_file(&sentinel_path);
                            match inner.heartbeat_source.poll() {
                                Ok(updated) => {
                                    let outcome = inner.handle_state_update(updated);
                                    let sentinel = if outcome { &done_path } else { &error_path };
                                    if let Err(err) = std::fs::write(sentinel, b"") {
                                        warn!(error = %err, "failed to write redeploy sentinel");
                                    }
                                }
                                Err(err) => warn!(error = %err, "heartbeat poll on config watch failed"),
                            }
                        }
                        Ok(Err(err)) => debug!(error = %err, "inotify event error"),
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Stop all watcher/heartbeat threads and join them.
    pub fn finalize(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Directly apply a newly observed `DeviceStateList` (used by tests
    /// and by callers that already poll heartbeats through their own
    /// scheduling loop). Returns `true` if every affected root model
    /// reached a non-failed outcome.
    pub fn handle_state_update(&self, updated: DeviceStateList) -> bool {
        self.inner.handle_state_update(updated)
    }
}

impl Drop for AbnormalStatusHandler {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Classify a root model's failure per the decision procedure: master
/// host failure takes precedence, then dynamic-sched master-rank0 loss,
/// else the default class.
fn classify(placement: &RootModelPlacement, abnormal: &HashSet<DeviceInfo>) -> FailureClass {
    if let Some(host) = &placement.master_host {
        if abnormal.iter().any(|d| &d.node_id == host) {
            return FailureClass::NotSupportRedeploy;
        }
    }
    if placement.master_rank0_devices.iter().any(|d| abnormal.contains(d)) {
        if placement.dynamic_sched_capable {
            return FailureClass::NotSupportDynamicSched;
        }
        return FailureClass::NotSupportRedeploy;
    }
    FailureClass::NotSupportDefault
}

/// Poll for the `redeploy` sentinel file's existence, up to
/// `REDEPLOY_SENTINEL_POLLS` times at `REDEPLOY_SENTINEL_POLL_INTERVAL`.
fn wait_for_sentinel(path: &Path) -> bool {
    for _ in 0..crate::constants::REDEPLOY_SENTINEL_POLLS {
        if path.exists() {
            return true;
        }
        std::thread::sleep(crate::constants::REDEPLOY_SENTINEL_POLL_INTERVAL);
    }
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct FixedHeartbeat(StdMutex<DeviceStateList>);

    impl HeartbeatSource for FixedHeartbeat {
        fn poll(&self) -> Result<DeviceStateList> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct AlwaysFree;
    impl DeployGuard for AlwaysFree {
        fn is_deploying(&self, _root_model: &str) -> bool {
            false
        }
    }

    struct RecordingClearer(AtomicUsize);
    impl ExceptionDataClearer for RecordingClearer {
        fn clear(&self, _root_model: &str, _devices: &[DeviceInfo]) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn device(id: u32) -> DeviceInfo {
        DeviceInfo::new(DeviceType::Npu, "node-0", id)
    }

    #[test]
    fn healthy_update_dispatches_nothing() {
        let heartbeat = Arc::new(FixedHeartbeat(StdMutex::new(DeviceStateList::new())));
        let events: Arc<Mutex<Vec<AbnormalEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let handler = AbnormalStatusHandler::new(
            "/tmp/resource.json",
            heartbeat,
            Arc::new(AlwaysFree),
            Arc::new(RecordingClearer(AtomicUsize::new(0))),
            move |event| events_clone.lock().push(event),
            4,
        );
        assert!(handler.handle_state_update(DeviceStateList::new()));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn recoverable_failure_degrades_to_dynamic_sched() {
        let heartbeat = Arc::new(FixedHeartbeat(StdMutex::new(DeviceStateList::new())));
        let events: Arc<Mutex<Vec<AbnormalEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let clearer = Arc::new(RecordingClearer(AtomicUsize::new(0)));
        let handler = AbnormalStatusHandler::new(
            "/tmp/resource.json",
            heartbeat,
            Arc::new(AlwaysFree),
            clearer.clone(),
            move |event| events_clone.lock().push(event),
            4,
        );
        handler.register_placement(
            "model-a",
            RootModelPlacement {
                devices: vec![device(0), device(1)],
                dynamic_sched_capable: true,
                master_rank0_devices: vec![],
                master_host: None,
            },
        );

        let mut updated = DeviceStateList::new();
        updated.set_healthy(device(0), false);
        let ok = handler.handle_state_update(updated);

        assert!(ok);
        assert_eq!(clearer.0.load(Ordering::SeqCst), 1);
        let events = events.lock();
        assert!(matches!(events[0], AbnormalEvent::RedeployStart { .. }));
        assert!(matches!(events[1], AbnormalEvent::DynamicSched { .. }));
    }

    #[test]
    fn unrecoverable_failure_reports_failed_handle() {
        let heartbeat = Arc::new(FixedHeartbeat(StdMutex::new(DeviceStateList::new())));
        let events: Arc<Mutex<Vec<AbnormalEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let handler = AbnormalStatusHandler::new(
            "/tmp/resource.json",
            heartbeat,
            Arc::new(AlwaysFree),
            Arc::new(RecordingClearer(AtomicUsize::new(0))),
            move |event| events_clone.lock().push(event),
            4,
        );
        handler.register_placement(
            "model-a",
            RootModelPlacement {
                devices: vec![device(0)],
                dynamic_sched_capable: false,
                master_rank0_devices: vec![device(0)],
                master_host: None,
            },
        );

        let mut updated = DeviceStateList::new();
        updated.set_healthy(device(0), false);
        let ok = handler.handle_state_update(updated);

        assert!(!ok);
        let events = events.lock();
        assert!(matches!(
            events[0],
            AbnormalEvent::RedeployStart {
                class: FailureClass::NotSupportRedeploy,
                ..
            }
        ));
        assert!(matches!(events[1], AbnormalEvent::FailedHandleAbnormal { .. }));
    }

    #[test]
    fn master_rank0_loss_on_dynamic_sched_model_is_classified_distinctly() {
        let heartbeat = Arc::new(FixedHeartbeat(StdMutex::new(DeviceStateList::new())));
        let events: Arc<Mutex<Vec<AbnormalEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let handler = AbnormalStatusHandler::new(
            "/tmp/resource.json",
            heartbeat,
            Arc::new(AlwaysFree),
            Arc::new(RecordingClearer(AtomicUsize::new(0))),
            move |event| events_clone.lock().push(event),
            4,
        );
        handler.register_placement(
            "model-a",
            RootModelPlacement {
                devices: vec![device(0)],
                dynamic_sched_capable: true,
                master_rank0_devices: vec![device(0)],
                master_host: None,
            },
        );

        let mut updated = DeviceStateList::new();
        updated.set_healthy(device(0), false);
        handler.handle_state_update(updated);

        let events = events.lock();
        assert!(matches!(
            events[0],
            AbnormalEvent::RedeployStart {
                class: FailureClass::NotSupportDynamicSched,
                ..
            }
        ));
    }

    #[test]
    fn master_host_loss_is_not_support_redeploy_even_for_dynamic_sched_capable_model() {
        let heartbeat = Arc::new(FixedHeartbeat(StdMutex::new(DeviceStateList::new())));
        let events: Arc<Mutex<Vec<AbnormalEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let handler = AbnormalStatusHandler::new(
            "/tmp/resource.json",
            heartbeat,
            Arc::new(AlwaysFree),
            Arc::new(RecordingClearer(AtomicUsize::new(0))),
            move |event| events_clone.lock().push(event),
            4,
        );
        // Master rank-0 is device 0, but the whole host also carries
        // device 1; only device 1 goes abnormal here, so the
        // device-level rank0 check alone would miss it.
        handler.register_placement(
            "model-a",
            RootModelPlacement {
                devices: vec![device(0), device(1)],
                dynamic_sched_capable: true,
                master_rank0_devices: vec![device(0)],
                master_host: Some("node-0".into()),
            },
        );

        let mut updated = DeviceStateList::new();
        updated.set_healthy(device(1), false);
        handler.handle_state_update(updated);

        let events = events.lock();
        assert!(matches!(
            events[0],
            AbnormalEvent::RedeployStart {
                class: FailureClass::NotSupportRedeploy,
                ..
            }
        ));
    }

    #[cfg(feature = "observability")]
    #[test]
    fn dynamic_sched_decision_is_recorded_against_attached_metrics() {
        let heartbeat = Arc::new(FixedHeartbeat(StdMutex::new(DeviceStateList::new())));
        let metrics = Arc::new(hetero_deploy_observability::DeployMetrics::new().unwrap());
        let handler = AbnormalStatusHandler::new(
            "/tmp/resource.json",
            heartbeat,
            Arc::new(AlwaysFree),
            Arc::new(RecordingClearer(AtomicUsize::new(0))),
            |_event| {},
            4,
        )
        .with_metrics(metrics.clone());
        handler.register_placement(
            "model-a",
            RootModelPlacement {
                devices: vec![device(0), device(1)],
                dynamic_sched_capable: true,
                master_rank0_devices: vec![],
                master_host: None,
            },
        );

        let mut updated = DeviceStateList::new();
        updated.set_healthy(device(0), false);
        handler.handle_state_update(updated);

        let text = metrics.encode().unwrap();
        assert!(text.contains("classification=\"dynamic_sched\""));
    }
}

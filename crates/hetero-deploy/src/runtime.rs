//! [`HeterogeneousModelExecutor`]: the client-side handle of a deployed
//! flow model — `Feed`/`Fetch` against root queues, optional fetch
//! alignment, data-flow exception delivery, and the dynamic-sched
//! routing loop.

use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::plan::{DstGroupInfo, DynamicSchedIndex, LogicalGroupKey};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// One feed/fetch payload: a tensor, raw (unserialized) bytes, or an
/// empty marker used as end-of-stream.
#[derive(Debug, Clone)]
pub enum FlowMsg {
    /// A serialized tensor payload.
    Tensor(Vec<u8>),
    /// A raw-data payload bypassing tensor serialization.
    RawData(Vec<u8>),
    /// End-of-stream marker (empty-data feed/fetch variant).
    Empty,
}

/// A `FlowMsg` tagged with the trans-id it correlates to, used by
/// `FeedFlowMsg`/`FetchFlowMsg` and by the fetch aligner.
#[derive(Debug, Clone)]
pub struct FlowEnvelope {
    /// Correlating trans-id.
    pub trans_id: u64,
    /// The payload.
    pub msg: FlowMsg,
}

/// Root input/output queue access, implemented by
/// `hetero-deploy-transport` against real device message queues or by
/// an in-memory fake in tests.
pub trait RootQueue: Send + Sync {
    /// Enqueue a message on the root input queue at `index`,
    /// translating a queue-full/timeout condition to `Error::Timeout`.
    fn enqueue(&self, index: usize, msg: FlowEnvelope, timeout: Duration) -> Result<()>;

    /// Dequeue a message from the root output queue at `index`,
    /// translating a queue-empty condition to `Error::Timeout`.
    fn dequeue(&self, index: usize, timeout: Duration) -> Result<FlowEnvelope>;
}

/// Invoked before a fatal (non-timeout) queue error is bubbled, so the
/// upper layer can switch to degraded-serve ahead of the error
/// surfacing to the caller.
pub trait DevAbnormalCallback: Send + Sync {
    /// Notify that a device backing `indexes` hit a fatal error.
    fn on_abnormal(&self, indexes: &[usize], error: &Error);
}

/// Buffers per-output tensors by trans-id, emitting a fetch only once
/// every requested index has reported for that trans-id. Bounded: the
/// oldest unaligned trans-id is evicted on overflow and surfaced to the
/// caller as `Error::Expired`.
pub struct FetchAligner {
    expected: Vec<usize>,
    pending: LruCache<u64, HashMap<usize, FlowMsg>>,
}

impl FetchAligner {
    /// Construct an aligner expecting entries at every index in
    /// `expected`, bounded to `capacity` in-flight trans-ids.
    #[must_use]
    pub fn new(expected: Vec<usize>, capacity: usize) -> Self {
        Self {
            expected,
            pending: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1")),
        }
    }

    /// Offer one index's arrival for a trans-id. Returns the fully
    /// aligned set once every expected index has arrived, or the
    /// trans-id evicted by this insertion (to be surfaced as
    /// `Error::Expired`) alongside `None` when still pending.
    pub fn offer(&mut self, trans_id: u64, index: usize, msg: FlowMsg) -> (Option<Vec<(usize, FlowMsg)>>, Option<u64>) {
        let mut evicted_id = None;
        if !self.pending.contains(&trans_id) {
            if self.pending.len() == self.pending.cap().get() {
                if let Some((oldest_id, _)) = self.pending.pop_lru() {
                    evicted_id = Some(oldest_id);
                }
            }
            self.pending.put(trans_id, HashMap::new());
        }

        let entry = self.pending.get_mut(&trans_id).expect("just inserted or already present");
        entry.insert(index, msg);

        if self.expected.iter().all(|idx| entry.contains_key(idx)) {
            let mut completed = self.pending.pop(&trans_id).expect("trans_id present");
            let aligned: Vec<(usize, FlowMsg)> = self
                .expected
                .iter()
                .map(|idx| (*idx, completed.remove(idx).expect("checked present above")))
                .collect();
            return (Some(aligned), evicted_id);
        }

        (None, evicted_id)
    }
}

/// Record of a data-flow exception reported by an executor.
#[derive(Debug, Clone)]
pub struct DataFlowExceptionRecord {
    /// Exception scope; empty string is the reserved model-IO scope.
    pub scope: String,
    /// Raw exception code from the executor.
    pub code: i32,
    /// First 64 bytes of exception context (timing/flow metadata).
    pub context: Vec<u8>,
}

/// FIFO-bounded cache of data-flow exceptions keyed by trans-id, one
/// entry per trans-id, oldest evicted on overflow.
pub struct DataFlowExceptionCache {
    order: VecDeque<u64>,
    entries: HashMap<u64, DataFlowExceptionRecord>,
    bound: usize,
}

impl DataFlowExceptionCache {
    /// Construct an empty cache bounded to `bound` live entries.
    #[must_use]
    pub fn new(bound: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            bound: bound.max(1),
        }
    }

    /// Record a data-flow exception, truncating `context` to 64 bytes.
    /// Returns the trans-id evicted to make room, if any.
    pub fn notify(&mut self, trans_id: u64, scope: String, code: i32, context: Vec<u8>) -> Option<u64> {
        let context = context.into_iter().take(64).collect();
        if !self.entries.contains_key(&trans_id) {
            self.order.push_back(trans_id);
        }
        self.entries.insert(trans_id, DataFlowExceptionRecord { scope, code, context });

        if self.entries.len() <= self.bound {
            return None;
        }
        let oldest = self.order.pop_front()?;
        self.entries.remove(&oldest);
        Some(oldest)
    }

    /// Take and remove a single trans-id's record, if present.
    pub fn take(&mut self, trans_id: u64) -> Option<DataFlowExceptionRecord> {
        let record = self.entries.remove(&trans_id)?;
        self.order.retain(|id| *id != trans_id);
        Some(record)
    }

    /// Drain every live entry in insertion order.
    pub fn take_all_ordered(&mut self) -> Vec<(u64, DataFlowExceptionRecord)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|record| (id, record)))
            .collect()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache has no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reports the current observed queue depth for a dynamic-sched
/// candidate target, or `None` if the target is unreachable/unhealthy.
pub trait QueueDepthProvider: Send + Sync {
    /// Observed depth of `target`, or `None` if unhealthy/unknown.
    fn depth(&self, target: &str) -> Option<u32>;
}

/// One inbound routing request from the gateway-request queue:
/// `(model_uuid, logic_group_id, trans_id, route_label, choose_logic_id)`.
#[derive(Debug, Clone)]
pub struct FlowgwRequestEntry {
    /// Which root input queue this request arrived on.
    pub input_index: usize,
    /// Model-uuid used by the gateway.
    pub model_uuid: String,
    /// Logical group id within that model.
    pub logic_group_id: u32,
    /// Correlating trans-id.
    pub trans_id: u64,
    /// Dynamic-routing tag chosen by the producer side.
    pub route_label: u64,
}

/// The routing decision for one `FlowgwRequestEntry`.
#[derive(Debug, Clone)]
pub struct FlowgwResponseEntry {
    /// Root input queue this response is bound to.
    pub input_index: usize,
    /// Correlating trans-id.
    pub trans_id: u64,
    /// Chosen target queue/tag name.
    pub target: String,
    /// Device hosting the chosen target.
    pub device: DeviceInfo,
}

/// Resolves dynamic-sched routing decisions against a
/// `DynamicSchedIndex`, caching `trans_id -> (route_label, chosen
/// target)` so that repeated requests for the same trans-id and route
/// label reuse the earlier decision.
pub struct DynamicSchedRouter {
    index: DynamicSchedIndex,
    depth_provider: Arc<dyn QueueDepthProvider>,
    cache: Mutex<LruCache<u64, (u64, usize)>>,
}

impl DynamicSchedRouter {
    /// Construct a router over the planner's dynamic-sched index,
    /// consulting `depth_provider` for live queue depths, with a
    /// decision cache bounded to `cache_bound` live trans-ids.
    #[must_use]
    pub fn new(index: DynamicSchedIndex, depth_provider: Arc<dyn QueueDepthProvider>, cache_bound: usize) -> Self {
        Self {
            index,
            depth_provider,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(cache_bound.max(1)).expect("capacity is at least 1"))),
        }
    }

    /// Resolve one routing request, updating the decision cache.
    pub fn resolve(&self, request: &FlowgwRequestEntry) -> Result<FlowgwResponseEntry> {
        let key = LogicalGroupKey {
            model_uuid: request.model_uuid.clone(),
            logic_group_id: request.logic_group_id,
        };
        let group = self.index.get(&key).ok_or_else(|| {
            Error::ParamInvalid(format!(
                "no dynamic-sched group for model {} group {}",
                request.model_uuid, request.logic_group_id
            ))
        })?;

        let mut cache = self.cache.lock();
        if let Some((cached_label, entry_index)) = cache.get(&request.trans_id).copied() {
            if cached_label == request.route_label {
                if let Some(candidate) = group.routes.get(entry_index) {
                    return Ok(self.to_response(request, candidate));
                }
            }
        }

        let chosen_index = self.choose_route(group)?;
        cache.put(request.trans_id, (request.route_label, chosen_index));
        let candidate = &group.routes[chosen_index];
        Ok(self.to_response(request, candidate))
    }

    fn choose_route(&self, group: &DstGroupInfo) -> Result<usize> {
        if group.routes.len() == 1 {
            return Ok(0);
        }

        let preferred = group.preferred();
        if let Some(idx) = self.pick_shallowest(preferred, 0) {
            return Ok(idx);
        }

        let fallback = group.fallback();
        if let Some(idx) = self.pick_shallowest(fallback, preferred.len()) {
            return Ok(idx);
        }

        Err(Error::ParamInvalid("no healthy dynamic-sched route candidate".into()))
    }

    /// Pick the candidate with the shallowest observed depth among
    /// `candidates` (offset by `base_offset` into the full route list),
    /// tie-breaking by lowest `route_label`. Returns `None` if every
    /// candidate is unhealthy.
    fn pick_shallowest(&self, candidates: &[crate::plan::RouteCandidate], base_offset: usize) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter_map(|(offset, candidate)| {
                self.depth_provider
                    .depth(&candidate.target)
                    .map(|depth| (depth, candidate.route_label, base_offset + offset))
            })
            .min_by_key(|(depth, route_label, _)| (*depth, *route_label))
            .map(|(_, _, idx)| idx)
    }

    fn to_response(&self, request: &FlowgwRequestEntry, candidate: &crate::plan::RouteCandidate) -> FlowgwResponseEntry {
        FlowgwResponseEntry {
            input_index: request.input_index,
            trans_id: request.trans_id,
            target: candidate.target.clone(),
            device: candidate.device.clone(),
        }
    }
}

/// Source of inbound `FlowgwRequestEntry`s and sink for resolved
/// `FlowgwResponseEntry`s, one pair per dynamic-sched root model.
pub trait FlowgwChannel: Send + Sync {
    /// Block (up to the implementation's own timeout policy) for the
    /// next routing request, or `None` when the channel is closed.
    fn recv(&self) -> Option<FlowgwRequestEntry>;
    /// Publish a resolved routing response.
    fn send(&self, response: FlowgwResponseEntry);
}

/// Client-side handle of a deployed flow model: `Feed`/`Fetch` against
/// root queues, optional fetch alignment, data-flow exception delivery,
/// and (for dynamic-sched models) the routing loop.
pub struct HeterogeneousModelExecutor {
    queues: Arc<dyn RootQueue>,
    abnormal_callback: Option<Arc<dyn DevAbnormalCallback>>,
    fetch_aligner: Option<Mutex<FetchAligner>>,
    data_flow_exceptions: Mutex<DataFlowExceptionCache>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HeterogeneousModelExecutor {
    /// Construct a runtime handle over the given root queue access,
    /// optional fetch aligner (when output alignment is configured),
    /// and data-flow exception cache bound.
    #[must_use]
    pub fn new(
        queues: Arc<dyn RootQueue>,
        abnormal_callback: Option<Arc<dyn DevAbnormalCallback>>,
        fetch_aligner: Option<FetchAligner>,
        data_flow_exception_cache_bound: usize,
    ) -> Self {
        Self {
            queues,
            abnormal_callback,
            fetch_aligner: fetch_aligner.map(Mutex::new),
            data_flow_exceptions: Mutex::new(DataFlowExceptionCache::new(data_flow_exception_cache_bound)),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue one or more tensors onto root input queue(s). A single
    /// message broadcast to several indexes enqueues in parallel
    /// (bounded to the index count); several messages targeting a
    /// single index enqueue as one fusion gather, in order.
    pub fn feed(&self, indexes: &[usize], msgs: Vec<FlowEnvelope>, timeout: Duration) -> Result<()> {
        if indexes.is_empty() {
            return Err(Error::ParamInvalid("feed requires at least one index".into()));
        }

        if msgs.len() == 1 && indexes.len() > 1 {
            let msg = msgs.into_iter().next().expect("len checked above");
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(indexes.len())
                .build()
                .map_err(|e| Error::Subprocess(format!("feed broadcast pool build failed: {e}")))?;
            let results: Vec<Result<()>> = pool.install(|| {
                use rayon::prelude::*;
                indexes
                    .par_iter()
                    .map(|idx| self.enqueue_translated(*idx, msg.clone(), timeout))
                    .collect()
            });
            for result in results {
                result?;
            }
            return Ok(());
        }

        if indexes.len() == 1 && !msgs.is_empty() {
            for msg in msgs {
                self.enqueue_translated(indexes[0], msg, timeout)?;
            }
            return Ok(());
        }

        Err(Error::ParamInvalid(format!(
            "feed index/message shape mismatch: {} indexes, {} messages",
            indexes.len(),
            msgs.len()
        )))
    }

    /// Dequeue from the root output queue(s). Without an aligner,
    /// returns as soon as every requested index has produced one
    /// message. With an aligner, buffers arrivals by trans-id and
    /// returns only once every requested index agrees on a trans-id.
    pub fn fetch(&self, indexes: &[usize], timeout: Duration) -> Result<Vec<(usize, FlowMsg)>> {
        let Some(aligner) = &self.fetch_aligner else {
            let mut out = Vec::with_capacity(indexes.len());
            for idx in indexes {
                let envelope = self.dequeue_translated(*idx, timeout)?;
                out.push((*idx, envelope.msg));
            }
            return Ok(out);
        };

        loop {
            for idx in indexes {
                let envelope = self.dequeue_translated(*idx, timeout)?;
                let (aligned, evicted) = aligner.lock().offer(envelope.trans_id, *idx, envelope.msg);
                if let Some(evicted_id) = evicted {
                    warn!(trans_id = evicted_id, "fetch alignment cache evicted oldest trans_id");
                    return Err(Error::Expired(evicted_id));
                }
                if let Some(aligned) = aligned {
                    return Ok(aligned);
                }
            }
        }
    }

    /// Report a data-flow exception from an executor. For the reserved
    /// model-IO scope (empty string) a pending `fetch` on the same
    /// trans-id should treat `take_data_flow_exception` as authoritative
    /// before blocking further.
    pub fn notify_data_flow_exception(&self, trans_id: u64, scope: String, code: i32, context: Vec<u8>) {
        if let Some(evicted) = self.data_flow_exceptions.lock().notify(trans_id, scope, code, context) {
            debug!(trans_id = evicted, "data-flow exception cache evicted oldest trans_id");
        }
    }

    /// Take a trans-id's recorded data-flow exception, if any, as an
    /// `Error::DataFlowException`.
    #[must_use]
    pub fn take_data_flow_exception(&self, trans_id: u64) -> Option<Error> {
        self.data_flow_exceptions.lock().take(trans_id).map(|record| Error::DataFlowException {
            trans_id,
            scope: record.scope,
            code: record.code,
        })
    }

    /// Drain every live data-flow exception in insertion order (used by
    /// `TakeWaitModelIoException`-style polling callers).
    pub fn take_all_data_flow_exceptions(&self) -> Vec<(u64, DataFlowExceptionRecord)> {
        self.data_flow_exceptions.lock().take_all_ordered()
    }

    /// Start the internal status-dequeue thread and, for dynamic-sched
    /// models, the routing thread. Idempotent: a second call while
    /// already running is a no-op.
    pub fn model_run_start(&self, dynamic_sched: Option<(Arc<DynamicSchedRouter>, Arc<dyn FlowgwChannel>)>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some((router, channel)) = dynamic_sched {
            let running = self.running.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_dynamic_sched", crate::constants::THREAD_NAME_PREFIX))
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        let Some(request) = channel.recv() else {
                            break;
                        };
                        match router.resolve(&request) {
                            Ok(response) => channel.send(response),
                            Err(err) => warn!(error = %err, "dynamic-sched routing decision failed"),
                        }
                    }
                })
                .expect("spawning the dynamic-sched routing thread must succeed");
            self.threads.lock().push(handle);
        }
    }

    /// Stop and join every runtime thread. Idempotent.
    pub fn model_run_stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn enqueue_translated(&self, index: usize, msg: FlowEnvelope, timeout: Duration) -> Result<()> {
        self.queues.enqueue(index, msg, timeout).map_err(|err| self.translate(&[index], err))
    }

    fn dequeue_translated(&self, index: usize, timeout: Duration) -> Result<FlowEnvelope> {
        self.queues.dequeue(index, timeout).map_err(|err| self.translate(&[index], err))
    }

    /// Queue-empty/queue-full conditions surface as `Error::Timeout`
    /// unchanged; any other error invokes the abnormal callback before
    /// bubbling, so the upper layer can switch to degraded-serve.
    fn translate(&self, indexes: &[usize], err: Error) -> Error {
        if matches!(err, Error::Timeout(_)) {
            return err;
        }
        if let Some(callback) = &self.abnormal_callback {
            callback.on_abnormal(indexes, &err);
        }
        err
    }
}

impl Drop for HeterogeneousModelExecutor {
    fn drop(&mut self) {
        self.model_run_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeQueues {
        inbound: StdMutex<StdHashMap<usize, VecDeque<FlowEnvelope>>>,
        outbound: StdMutex<StdHashMap<usize, VecDeque<FlowEnvelope>>>,
    }

    impl FakeQueues {
        fn new() -> Self {
            Self {
                inbound: StdMutex::new(StdHashMap::new()),
                outbound: StdMutex::new(StdHashMap::new()),
            }
        }

        fn push_outbound(&self, index: usize, envelope: FlowEnvelope) {
            self.outbound.lock().unwrap().entry(index).or_default().push_back(envelope);
        }
    }

    impl RootQueue for FakeQueues {
        fn enqueue(&self, index: usize, msg: FlowEnvelope, _timeout: Duration) -> Result<()> {
            self.inbound.lock().unwrap().entry(index).or_default().push_back(msg);
            Ok(())
        }

        fn dequeue(&self, index: usize, _timeout: Duration) -> Result<FlowEnvelope> {
            self.outbound
                .lock()
                .unwrap()
                .get_mut(&index)
                .and_then(VecDeque::pop_front)
                .ok_or(Error::Timeout(Duration::from_millis(1)))
        }
    }

    fn tensor(bytes: &[u8]) -> FlowMsg {
        FlowMsg::Tensor(bytes.to_vec())
    }

    #[test]
    fn feed_broadcasts_one_message_to_several_indexes() {
        let queues = Arc::new(FakeQueues::new());
        let executor = HeterogeneousModelExecutor::new(queues.clone(), None, None, 1024);
        executor
            .feed(
                &[0, 1, 2],
                vec![FlowEnvelope {
                    trans_id: 7,
                    msg: tensor(b"x"),
                }],
                Duration::from_millis(10),
            )
            .unwrap();
        assert_eq!(queues.inbound.lock().unwrap().len(), 3);
    }

    #[test]
    fn feed_fuses_several_messages_onto_one_index() {
        let queues = Arc::new(FakeQueues::new());
        let executor = HeterogeneousModelExecutor::new(queues.clone(), None, None, 1024);
        executor
            .feed(
                &[0],
                vec![
                    FlowEnvelope {
                        trans_id: 1,
                        msg: tensor(b"a"),
                    },
                    FlowEnvelope {
                        trans_id: 1,
                        msg: tensor(b"b"),
                    },
                ],
                Duration::from_millis(10),
            )
            .unwrap();
        assert_eq!(queues.inbound.lock().unwrap().get(&0).unwrap().len(), 2);
    }

    #[test]
    fn fetch_without_aligner_returns_immediately_per_index() {
        let queues = Arc::new(FakeQueues::new());
        queues.push_outbound(0, FlowEnvelope { trans_id: 1, msg: tensor(b"a") });
        queues.push_outbound(1, FlowEnvelope { trans_id: 2, msg: tensor(b"b") });
        let executor = HeterogeneousModelExecutor::new(queues, None, None, 1024);
        let result = executor.fetch(&[0, 1], Duration::from_millis(10)).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn fetch_with_aligner_waits_for_matching_trans_id() {
        let queues = Arc::new(FakeQueues::new());
        // Index 0 gets trans_id 1 first (stale), then trans_id 2 (matches index 1).
        queues.push_outbound(0, FlowEnvelope { trans_id: 1, msg: tensor(b"stale") });
        queues.push_outbound(1, FlowEnvelope { trans_id: 2, msg: tensor(b"b") });
        queues.push_outbound(0, FlowEnvelope { trans_id: 2, msg: tensor(b"a") });

        let aligner = FetchAligner::new(vec![0, 1], 16);
        let executor = HeterogeneousModelExecutor::new(queues, None, Some(aligner), 1024);

        // First round: index 0 yields trans_id 1 (buffered, incomplete),
        // index 1 yields trans_id 2 (buffered, incomplete). Loop again:
        // index 0 yields trans_id 2, completing the alignment.
        let result = executor.fetch(&[0, 1], Duration::from_millis(10));
        assert!(result.is_ok());
        let aligned = result.unwrap();
        assert_eq!(aligned.len(), 2);
    }

    #[test]
    fn data_flow_exception_cache_evicts_oldest_past_bound() {
        let mut cache = DataFlowExceptionCache::new(1024);
        for trans_id in 0..1025u64 {
            let evicted = cache.notify(trans_id, String::new(), -1, vec![]);
            if trans_id < 1024 {
                assert!(evicted.is_none());
            } else {
                assert_eq!(evicted, Some(0));
            }
        }
        assert_eq!(cache.len(), 1024);
        let ordered = cache.take_all_ordered();
        assert_eq!(ordered.len(), 1024);
        assert_eq!(ordered[0].0, 1);
        assert_eq!(ordered.last().unwrap().0, 1024);
    }

    struct FixedDepth(StdHashMap<String, u32>);
    impl QueueDepthProvider for FixedDepth {
        fn depth(&self, target: &str) -> Option<u32> {
            self.0.get(target).copied()
        }
    }

    fn device(id: u32) -> DeviceInfo {
        DeviceInfo::new(DeviceType::Npu, "node-0", id)
    }

    #[test]
    fn dynamic_sched_picks_shallowest_preferred_route() {
        use crate::plan::RouteCandidate;

        let key = LogicalGroupKey {
            model_uuid: "m".into(),
            logic_group_id: 1,
        };
        let mut index = DynamicSchedIndex::new();
        index.insert(
            key.clone(),
            DstGroupInfo {
                routes: vec![
                    RouteCandidate {
                        route_label: 0,
                        target: "q0".into(),
                        device: device(0),
                    },
                    RouteCandidate {
                        route_label: 1,
                        target: "q1".into(),
                        device: device(1),
                    },
                ],
                group_size: 2,
            },
        );

        let mut depths = StdHashMap::new();
        depths.insert("q0".to_string(), 5);
        depths.insert("q1".to_string(), 2);
        let router = DynamicSchedRouter::new(index, Arc::new(FixedDepth(depths)), 1024);

        let request = FlowgwRequestEntry {
            input_index: 0,
            model_uuid: "m".into(),
            logic_group_id: 1,
            trans_id: 42,
            route_label: 9,
        };
        let response = router.resolve(&request).unwrap();
        assert_eq!(response.target, "q1");
    }

    #[test]
    fn dynamic_sched_reuses_cached_decision_for_same_trans_id_and_label() {
        use crate::plan::RouteCandidate;

        let key = LogicalGroupKey {
            model_uuid: "m".into(),
            logic_group_id: 1,
        };
        let mut index = DynamicSchedIndex::new();
        index.insert(
            key,
            DstGroupInfo {
                routes: vec![
                    RouteCandidate {
                        route_label: 0,
                        target: "q0".into(),
                        device: device(0),
                    },
                    RouteCandidate {
                        route_label: 1,
                        target: "q1".into(),
                        device: device(1),
                    },
                ],
                group_size: 2,
            },
        );

        let mut depths = StdHashMap::new();
        depths.insert("q0".to_string(), 1);
        depths.insert("q1".to_string(), 9);
        let router = DynamicSchedRouter::new(index, Arc::new(FixedDepth(depths)), 1024);

        let request = FlowgwRequestEntry {
            input_index: 0,
            model_uuid: "m".into(),
            logic_group_id: 1,
            trans_id: 42,
            route_label: 9,
        };
        let first = router.resolve(&request).unwrap();
        assert_eq!(first.target, "q0");

        // Even though q0 would no longer look cheapest, the cached
        // decision for the same (trans_id, route_label) is reused.
        let mut depths2 = StdHashMap::new();
        depths2.insert("q0".to_string(), 50);
        depths2.insert("q1".to_string(), 1);
        let router2 = DynamicSchedRouter::new(DynamicSchedIndex::new(), Arc::new(FixedDepth(depths2)), 1024);
        let _ = router2; // separate instance only to document the cache is per-router
        let second = router.resolve(&request).unwrap();
        assert_eq!(second.target, "q0");
    }
}

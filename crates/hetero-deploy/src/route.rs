//! The endpoint/binding graph realized on a single node: [`FlowRoutePlan`],
//! [`EndpointDesc`], and the before-load/after-load binding lists.

use crate::device::DeviceInfo;
use serde::{Deserialize, Serialize};

/// Index of an endpoint within a [`FlowRoutePlan`]'s endpoint vector.
pub type EndpointIndex = usize;

/// Queue overwrite policy when a PUSH producer outruns its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwritePolicy {
    /// Block the producer until space is available.
    Block,
    /// Drop the oldest queued item to make room.
    OverwriteOldest,
}

/// Push/pull role, determined during `PreDeploy` by scanning bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueMode {
    /// This endpoint is a binding source: PUSH mode.
    Push,
    /// This endpoint is not a binding source: PULL mode.
    Pull,
}

/// Per-endpoint queue attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueAttrs {
    /// Queue depth.
    pub depth: u32,
    /// Push/pull mode, resolved during `PreDeploy`.
    pub mode: QueueMode,
    /// Overwrite policy when full.
    pub overwrite_policy: OverwritePolicy,
    /// Fusion offset: byte offset of this input within a fused gather
    /// buffer, when several tensors are packed onto one queue.
    pub fusion_offset: u32,
    /// For `RefQueue` endpoints: the index of the referent Queue
    /// endpoint within the same `FlowRoutePlan`.
    pub ref_index: Option<EndpointIndex>,
}

impl Default for QueueAttrs {
    fn default() -> Self {
        Self {
            depth: 1,
            mode: QueueMode::Pull,
            overwrite_policy: OverwritePolicy::Block,
            fusion_offset: 0,
            ref_index: None,
        }
    }
}

/// Per-endpoint tag attributes (cross-node endpoints backed by an hcom
/// handle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagAttrs {
    /// Local tag id.
    pub tag_id: u32,
    /// Peer-side tag id.
    pub peer_tag_id: u32,
    /// Local rank id within the hcom group.
    pub rank_id: u32,
    /// Peer rank id.
    pub peer_rank_id: u32,
    /// Queue depth behind the tag.
    pub depth: u32,
    /// Opaque hcom handle identifier, resolved at `PreDeploy`.
    pub hcom_handle: Option<String>,
}

/// Endpoint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    /// A plain on-device message queue.
    Queue,
    /// A queue resolved via name lookup against a registry on the
    /// target device.
    ExternalQueue,
    /// A queue that copies the physical id of an earlier Queue endpoint.
    RefQueue,
    /// A queue whose producer side provides control-only data; no
    /// runtime traffic flows over it.
    DummyQueue,
    /// A cross-node endpoint backed by an hcom handle.
    Tag,
    /// A set of endpoints addressed as one logical port.
    Group,
}

/// One endpoint in a [`FlowRoutePlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDesc {
    /// Endpoint kind.
    pub kind: EndpointKind,
    /// Endpoint name, unique within the owning `FlowRoutePlan`.
    pub name: String,
    /// Owning device.
    pub device: DeviceInfo,
    /// Queue attributes, present for Queue/ExternalQueue/RefQueue/
    /// DummyQueue endpoints.
    pub queue_attrs: Option<QueueAttrs>,
    /// Tag attributes, present for Tag endpoints.
    pub tag_attrs: Option<TagAttrs>,
    /// Group membership: indexes of member endpoints, present for
    /// Group endpoints. Members must not themselves be Groups.
    pub group_members: Vec<EndpointIndex>,
}

impl EndpointDesc {
    /// Construct a plain Queue endpoint.
    #[must_use]
    pub fn queue(name: impl Into<String>, device: DeviceInfo) -> Self {
        Self {
            kind: EndpointKind::Queue,
            name: name.into(),
            device,
            queue_attrs: Some(QueueAttrs::default()),
            tag_attrs: None,
            group_members: Vec::new(),
        }
    }

    /// Construct a RefQueue endpoint referring to an earlier endpoint.
    #[must_use]
    pub fn ref_queue(
        name: impl Into<String>,
        device: DeviceInfo,
        ref_index: EndpointIndex,
        fusion_offset: u32,
    ) -> Self {
        Self {
            kind: EndpointKind::RefQueue,
            name: name.into(),
            device,
            queue_attrs: Some(QueueAttrs {
                ref_index: Some(ref_index),
                fusion_offset,
                ..QueueAttrs::default()
            }),
            tag_attrs: None,
            group_members: Vec::new(),
        }
    }

    /// Construct a Group endpoint over the given member indexes.
    #[must_use]
    pub fn group(name: impl Into<String>, device: DeviceInfo, members: Vec<EndpointIndex>) -> Self {
        Self {
            kind: EndpointKind::Group,
            name: name.into(),
            device,
            queue_attrs: None,
            tag_attrs: None,
            group_members: members,
        }
    }
}

/// A binding: a producer endpoint feeding a consumer endpoint, installed
/// through the gateway client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Source (producer) endpoint index.
    pub src: EndpointIndex,
    /// Destination (consumer) endpoint index.
    pub dst: EndpointIndex,
}

/// The endpoint/binding graph realized on a single node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowRoutePlan {
    /// Node this plan is realized on.
    pub node_id: String,
    /// All endpoints, indexed by position.
    pub endpoints: Vec<EndpointDesc>,
    /// Bindings that must exist before submodel load (static routes).
    pub before_load_bindings: Vec<Binding>,
    /// Bindings completed only after executors report their queues up.
    pub after_load_bindings: Vec<Binding>,
}

impl FlowRoutePlan {
    /// Construct an empty plan for the given node.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Append an endpoint, returning its index.
    pub fn push_endpoint(&mut self, endpoint: EndpointDesc) -> EndpointIndex {
        self.endpoints.push(endpoint);
        self.endpoints.len() - 1
    }

    /// All endpoint indexes that appear as a binding source in either
    /// binding list.
    #[must_use]
    pub fn binding_sources(&self) -> std::collections::HashSet<EndpointIndex> {
        self.before_load_bindings
            .iter()
            .chain(self.after_load_bindings.iter())
            .map(|b| b.src)
            .collect()
    }

    /// Validate the data model invariants that apply to a single
    /// `FlowRoutePlan`:
    ///  - every RefQueue's `ref_index` resolves to an earlier Queue
    ///    endpoint in the same plan;
    ///  - a Group's members must not themselves be Groups;
    ///  - every binding source has kind Queue or RefQueue;
    ///  - every binding source is in PUSH mode; every other queue is
    ///    PULL.
    pub fn validate(&self) -> crate::error::Result<()> {
        let sources = self.binding_sources();
        for (idx, endpoint) in self.endpoints.iter().enumerate() {
            match endpoint.kind {
                EndpointKind::RefQueue => {
                    let ref_index = endpoint
                        .queue_attrs
                        .as_ref()
                        .and_then(|a| a.ref_index)
                        .ok_or_else(|| {
                            crate::error::Error::ParamInvalid(format!(
                                "RefQueue endpoint {idx} missing ref_index"
                            ))
                        })?;
                    if ref_index >= idx {
                        return Err(crate::error::Error::ParamInvalid(format!(
                            "RefQueue endpoint {idx} ref_index {ref_index} does not precede it"
                        )));
                    }
                    let referent = &self.endpoints[ref_index];
                    if referent.kind != EndpointKind::Queue {
                        return Err(crate::error::Error::ParamInvalid(format!(
                            "RefQueue endpoint {idx} refers to non-Queue endpoint {ref_index}"
                        )));
                    }
                }
                EndpointKind::Group => {
                    for member in &endpoint.group_members {
                        if self.endpoints[*member].kind == EndpointKind::Group {
                            return Err(crate::error::Error::ParamInvalid(format!(
                                "Group endpoint {idx} has a Group member {member}"
                            )));
                        }
                    }
                }
                _ => {}
            }

            if sources.contains(&idx)
                && !matches!(endpoint.kind, EndpointKind::Queue | EndpointKind::RefQueue)
            {
                return Err(crate::error::Error::ParamInvalid(format!(
                    "endpoint {idx} is a binding source but has kind {:?}, expected Queue or RefQueue",
                    endpoint.kind
                )));
            }

            if let Some(attrs) = &endpoint.queue_attrs {
                let expected_mode = if sources.contains(&idx) {
                    QueueMode::Push
                } else {
                    QueueMode::Pull
                };
                if attrs.mode != expected_mode {
                    return Err(crate::error::Error::ParamInvalid(format!(
                        "endpoint {idx} has mode {:?}, expected {:?} given binding role",
                        attrs.mode, expected_mode
                    )));
                }
            }
        }
        Ok(())
    }

    /// Recompute each queue endpoint's `mode` from the current binding
    /// lists, per `PreDeploy` step (a): any endpoint appearing as a
    /// binding source is PUSH, all others are PULL.
    pub fn resolve_queue_modes(&mut self) {
        let sources = self.binding_sources();
        for (idx, endpoint) in self.endpoints.iter_mut().enumerate() {
            if let Some(attrs) = endpoint.queue_attrs.as_mut() {
                attrs.mode = if sources.contains(&idx) {
                    QueueMode::Push
                } else {
                    QueueMode::Pull
                };
            }
        }
    }
}

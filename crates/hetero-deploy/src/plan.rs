//! The planner's output: [`DeployPlan`], plus the dynamic-sched index
//! structures consulted at runtime by the [`crate::runtime`] executor
//! handle.

use crate::device::DeviceInfo;
use crate::route::FlowRoutePlan;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A candidate physical route for a dynamic-sched logical group entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCandidate {
    /// Dynamic-routing tag chosen by the producer side to pin a
    /// trans-id to this entry.
    pub route_label: u64,
    /// Target queue/tag name this candidate resolves to.
    pub target: String,
    /// Device hosting the target.
    pub device: DeviceInfo,
}

/// Destination group info for a `DynamicSchedIndex` entry: the ordered
/// list of candidate routes, with the first `group_size` entries being
/// the preferred subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DstGroupInfo {
    /// All candidate routes for this logical group, in preference order.
    pub routes: Vec<RouteCandidate>,
    /// Number of leading entries in `routes` considered preferred.
    pub group_size: usize,
}

impl DstGroupInfo {
    /// The preferred subset `[0, group_size)`.
    #[must_use]
    pub fn preferred(&self) -> &[RouteCandidate] {
        let bound = self.group_size.min(self.routes.len());
        &self.routes[..bound]
    }

    /// Entries beyond the preferred subset.
    #[must_use]
    pub fn fallback(&self) -> &[RouteCandidate] {
        let bound = self.group_size.min(self.routes.len());
        &self.routes[bound..]
    }
}

/// Identifies a logical group input/output port on a dynamic submodel:
/// `(model_uuid, logic_group_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalGroupKey {
    /// Model-uuid used by the gateway.
    pub model_uuid: String,
    /// Logical group id within that model.
    pub logic_group_id: u32,
}

/// For every logical-group input/output port on a dynamic submodel, the
/// list of candidate routes and the preferred subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicSchedIndex {
    entries: HashMap<LogicalGroupKey, DstGroupInfo>,
}

impl DynamicSchedIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the group info for a logical group key.
    pub fn insert(&mut self, key: LogicalGroupKey, info: DstGroupInfo) {
        self.entries.insert(key, info);
    }

    /// Look up a logical group's destination info.
    #[must_use]
    pub fn get(&self, key: &LogicalGroupKey) -> Option<&DstGroupInfo> {
        self.entries.get(key)
    }

    /// Number of logical groups indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-device variable-memory requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarMemoryRequirement {
    /// Device the requirement applies to.
    pub device: DeviceInfo,
    /// Required variable-memory bytes.
    pub bytes: u64,
}

/// One row of the hcom rank table: a device's assigned rank within a
/// named communication group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankTableEntry {
    /// Device this rank belongs to.
    pub device: DeviceInfo,
    /// Assigned rank id.
    pub rank_id: u32,
    /// Comm group name.
    pub group_name: String,
}

/// The planner's output: device assignment, per-device submodel list,
/// variable-memory requirements, hcom rank table, comm groups, and the
/// dynamic-sched index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployPlan {
    /// `submodel name -> assigned device`.
    pub assignment: HashMap<String, DeviceInfo>,
    /// `node_id -> submodel names placed on that node`.
    pub per_device_submodels: HashMap<String, Vec<String>>,
    /// Variable-memory requirements, one per device that needs any.
    pub var_memory_requirements: Vec<VarMemoryRequirement>,
    /// hcom rank table.
    pub rank_table: Vec<RankTableEntry>,
    /// `group_name -> member devices`.
    pub comm_groups: HashMap<String, Vec<DeviceInfo>>,
    /// Dynamic-sched index for dynamic submodels.
    pub dynamic_sched_index: DynamicSchedIndex,
    /// Per-node `FlowRoutePlan`s, keyed by `node_id`.
    pub route_plans: HashMap<String, FlowRoutePlan>,
}

impl DeployPlan {
    /// Empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All node ids touched by this plan's endpoints (union over every
    /// `FlowRoutePlan`'s endpoints).
    ///
    /// Invariant 1 from the testable-properties section: this must equal
    /// the set of keys in `route_plans`.
    #[must_use]
    pub fn endpoint_node_ids(&self) -> std::collections::HashSet<String> {
        self.route_plans
            .values()
            .flat_map(|plan| plan.endpoints.iter().map(|e| e.device.node_id.clone()))
            .collect()
    }

    /// Whether this plan is empty (no assignments, no route plans): the
    /// boundary case where `DeployModel` succeeds trivially and
    /// `Undeploy` is a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignment.is_empty() && self.route_plans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::route::EndpointDesc;

    #[test]
    fn empty_plan_is_empty() {
        assert!(DeployPlan::new().is_empty());
    }

    #[test]
    fn preferred_subset_respects_group_size() {
        let device = DeviceInfo::new(DeviceType::Npu, "node-0", 0);
        let info = DstGroupInfo {
            routes: vec![
                RouteCandidate {
                    route_label: 0,
                    target: "q0".into(),
                    device: device.clone(),
                },
                RouteCandidate {
                    route_label: 1,
                    target: "q1".into(),
                    device: device.clone(),
                },
                RouteCandidate {
                    route_label: 2,
                    target: "q2".into(),
                    device,
                },
            ],
            group_size: 2,
        };
        assert_eq!(info.preferred().len(), 2);
        assert_eq!(info.fallback().len(), 1);
    }

    #[test]
    fn node_ids_derived_from_route_plan_endpoints() {
        let mut plan = DeployPlan::new();
        let mut route = FlowRoutePlan::new("node-0");
        route.push_endpoint(EndpointDesc::queue(
            "q0",
            DeviceInfo::new(DeviceType::Npu, "node-0", 0),
        ));
        plan.route_plans.insert("node-0".to_string(), route);
        let node_ids = plan.endpoint_node_ids();
        assert!(node_ids.contains("node-0"));
        assert_eq!(node_ids.len(), 1);
    }
}

//! [`DeploymentPlanner`]: turns a [`FlowModel`] plus a node-local
//! [`ResourceManager`] into a [`DeployPlan`] — device assignment,
//! per-node [`FlowRoutePlan`]s, and the dynamic-sched index.
//!
//! Replica placement is assumed to stay within one node: replicas of a
//! submodel may land on different devices but not different nodes. This
//! keeps `Group` endpoint construction local to a single
//! `FlowRoutePlan` (its members must share an index space). Multi-node
//! replica spread is not a scenario this spec exercises.

use crate::device::{DeviceInfo, ResourceManager};
use crate::error::{Error, Result};
use crate::model::{Engine, FlowModel, LoadMode, PortRef, Submodel};
use crate::plan::{DeployPlan, DstGroupInfo, DynamicSchedIndex, LogicalGroupKey, RankTableEntry, RouteCandidate, VarMemoryRequirement};
use crate::route::{Binding, EndpointDesc, EndpointIndex, FlowRoutePlan, TagAttrs};
use std::collections::HashMap;

/// One placed replica: its instance id (as it appears in
/// `DeployPlan::assignment` and `per_device_submodels`) and assigned
/// device.
#[derive(Debug, Clone)]
struct Instance {
    id: String,
    device: DeviceInfo,
}

/// A producer or consumer endpoint already realized in some node's
/// `FlowRoutePlan`.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    index: EndpointIndex,
}

/// Builds a [`DeployPlan`] from a [`FlowModel`], consulting a
/// [`ResourceManager`] for device placement.
///
/// Steps, matching the planner algorithm:
/// 1. resolve each submodel's engine;
/// 2. allocate a device per replica;
/// 3. sum variable-memory requirements per device;
/// 4. walk the model relation graph, building endpoints and bindings
///    (or registering dynamic-sched candidates for `Dynamic` consumers);
/// 5. emit Group endpoints with single-member elision deferred to the
///    exchange route engine (the planner always emits Groups it builds
///    with >1 member; elision only happens later, at runtime, if
///    members drop out);
/// 6. emit the per-node `FlowRoutePlan`s and `DynamicSchedIndex`.
pub struct DeploymentPlanner<'a> {
    resource_manager: &'a dyn ResourceManager,
}

impl<'a> DeploymentPlanner<'a> {
    /// Construct a planner over the given resource manager.
    #[must_use]
    pub fn new(resource_manager: &'a dyn ResourceManager) -> Self {
        Self { resource_manager }
    }

    /// Build a full [`DeployPlan`] for `model`. Fails fast with
    /// `DeployFailed` on the first placement or validation error; no
    /// partial plan is returned.
    pub fn plan(&self, model: &FlowModel) -> Result<DeployPlan> {
        model.validate_port_counts()?;

        let mut deploy_plan = DeployPlan::new();
        let mut instances: HashMap<String, Vec<Instance>> = HashMap::new();

        for submodel in model.submodels() {
            let placed = self.place_replicas(submodel)?;
            for instance in &placed {
                deploy_plan
                    .assignment
                    .insert(instance.id.clone(), instance.device.clone());
                deploy_plan
                    .per_device_submodels
                    .entry(instance.device.node_id.clone())
                    .or_default()
                    .push(instance.id.clone());
            }
            instances.insert(submodel.name.clone(), placed);
        }

        deploy_plan.var_memory_requirements = self.var_memory_requirements(model, &instances);

        let mut route_plans: HashMap<String, FlowRoutePlan> = HashMap::new();
        let mut endpoint_cache: HashMap<(String, String, bool), (String, EndpointIndex)> = HashMap::new();
        let mut tag_cache: HashMap<(String, EndpointIndex, String), (EndpointIndex, EndpointIndex)> = HashMap::new();
        let mut dynamic_sched_index = DynamicSchedIndex::new();
        let mut rank_table: Vec<RankTableEntry> = Vec::new();
        let mut comm_groups: HashMap<String, Vec<DeviceInfo>> = HashMap::new();

        for (producer_ref, consumer_ref) in model.relation().edges() {
            let producer_instances = instances.get(&producer_ref.submodel).ok_or_else(|| {
                Error::DeployFailed {
                    step: "ResolveFlowRoutePlans",
                    reason: format!("no placement for producer submodel {}", producer_ref.submodel),
                }
            })?;
            let consumer_submodel = model.submodel(&consumer_ref.submodel).ok_or_else(|| Error::DeployFailed {
                step: "ResolveFlowRoutePlans",
                reason: format!("unknown consumer submodel {}", consumer_ref.submodel),
            })?;
            let consumer_instances = instances.get(&consumer_ref.submodel).ok_or_else(|| {
                Error::DeployFailed {
                    step: "ResolveFlowRoutePlans",
                    reason: format!("no placement for consumer submodel {}", consumer_ref.submodel),
                }
            })?;

            let resolved_producer = self.resolve_producer(
                &producer_ref,
                producer_instances,
                &mut route_plans,
                &mut endpoint_cache,
                &mut rank_table,
                &mut comm_groups,
            )?;

            for consumer_instance in consumer_instances {
                let (consumer_node, consumer_idx) = self.get_or_create_endpoint(
                    &consumer_ref,
                    consumer_instance,
                    &mut route_plans,
                    &mut endpoint_cache,
                );

                if consumer_submodel.load_mode == LoadMode::Dynamic {
                    self.register_dynamic_candidate(
                        model,
                        consumer_submodel,
                        &consumer_ref,
                        consumer_instance,
                        &mut dynamic_sched_index,
                    );
                    continue;
                }

                self.bind(
                    &resolved_producer,
                    (consumer_node.as_str(), consumer_idx),
                    &mut route_plans,
                    &mut tag_cache,
                )?;
            }
        }

        for plan in route_plans.values_mut() {
            plan.resolve_queue_modes();
            plan.validate()?;
        }

        deploy_plan.route_plans = route_plans;
        deploy_plan.dynamic_sched_index = dynamic_sched_index;
        deploy_plan.rank_table = rank_table;
        deploy_plan.comm_groups = comm_groups;
        Ok(deploy_plan)
    }

    fn place_replicas(&self, submodel: &Submodel) -> Result<Vec<Instance>> {
        let engine = submodel.resolved_engine();
        let replica_count = submodel.replica_count.max(1);
        let mut placed = Vec::with_capacity(replica_count as usize);
        for idx in 0..replica_count {
            let device = self.resource_manager.allocate(engine, submodel.pinned_device())?;
            let id = if replica_count == 1 {
                submodel.name.clone()
            } else {
                format!("{}#{idx}", submodel.name)
            };
            placed.push(Instance { id, device });
        }
        Ok(placed)
    }

    fn var_memory_requirements(
        &self,
        model: &FlowModel,
        instances: &HashMap<String, Vec<Instance>>,
    ) -> Vec<VarMemoryRequirement> {
        let mut per_device: HashMap<DeviceInfo, u64> = HashMap::new();
        for submodel in model.submodels() {
            let Some(bytes) = submodel.attributes.get("var_memory_bytes").and_then(|v| v.parse::<u64>().ok()) else {
                continue;
            };
            if let Some(placed) = instances.get(&submodel.name) {
                for instance in placed {
                    *per_device.entry(instance.device.clone()).or_insert(0) += bytes;
                }
            }
        }
        let mut requirements: Vec<VarMemoryRequirement> = per_device
            .into_iter()
            .map(|(device, bytes)| VarMemoryRequirement { device, bytes })
            .collect();
        requirements.sort_by(|a, b| a.device.cmp(&b.device));
        requirements
    }

    /// Resolve (creating if needed) the single endpoint that represents
    /// a producer port: the lone Queue endpoint when there is one
    /// instance, or a Group wrapping every instance's Queue when there
    /// are several. Group members must share a node, per this module's
    /// colocated-replica assumption.
    fn resolve_producer(
        &self,
        producer_ref: &PortRef,
        producer_instances: &[Instance],
        route_plans: &mut HashMap<String, FlowRoutePlan>,
        endpoint_cache: &mut HashMap<(String, String, bool), (String, EndpointIndex)>,
        rank_table: &mut Vec<RankTableEntry>,
        comm_groups: &mut HashMap<String, Vec<DeviceInfo>>,
    ) -> Result<(String, Resolved)> {
        let mut member_indexes: Vec<(String, EndpointIndex)> = Vec::new();
        for instance in producer_instances {
            let (node, idx) = self.get_or_create_endpoint(producer_ref, instance, route_plans, endpoint_cache);
            member_indexes.push((node, idx));
        }

        if member_indexes.len() == 1 {
            let Some((node, idx)) = member_indexes.into_iter().next() else {
                return Err(Error::DeployFailed {
                    step: "ResolveFlowRoutePlans",
                    reason: format!(
                        "producer {}.{} resolved to no endpoints",
                        producer_ref.submodel, producer_ref.port
                    ),
                });
            };
            return Ok((node, Resolved { index: idx }));
        }

        let node = member_indexes[0].0.clone();
        if member_indexes.iter().any(|(n, _)| n != &node) {
            return Err(Error::DeployFailed {
                step: "ResolveFlowRoutePlans",
                reason: format!(
                    "producer {}.{} has replicas spread across nodes; not supported",
                    producer_ref.submodel, producer_ref.port
                ),
            });
        }

        let group_name = format!("{}.{}.group", producer_ref.submodel, producer_ref.port);
        let group_cache_key = (producer_ref.submodel.clone(), format!("{}#group", producer_ref.port), true);
        if let Some((cached_node, cached_idx)) = endpoint_cache.get(&group_cache_key) {
            return Ok((cached_node.clone(), Resolved { index: *cached_idx }));
        }

        let members: Vec<EndpointIndex> = member_indexes.iter().map(|(_, idx)| *idx).collect();
        let plan = route_plans.get_mut(&node).ok_or_else(|| Error::DeployFailed {
            step: "ResolveFlowRoutePlans",
            reason: format!("node {node} plan missing after resolving its members"),
        })?;
        let device = plan.endpoints[members[0]].device.clone();
        let group_idx = plan.push_endpoint(EndpointDesc::group(group_name, device, members));
        endpoint_cache.insert(group_cache_key, (node.clone(), group_idx));

        let devices: Vec<DeviceInfo> = member_indexes.iter().map(|(_, idx)| plan.endpoints[*idx].device.clone()).collect();
        self.register_comm_group(&producer_ref.submodel, &producer_ref.port, &devices, rank_table, comm_groups);

        Ok((node, Resolved { index: group_idx }))
    }

    fn get_or_create_endpoint(
        &self,
        port_ref: &PortRef,
        instance: &Instance,
        route_plans: &mut HashMap<String, FlowRoutePlan>,
        endpoint_cache: &mut HashMap<(String, String, bool), (String, EndpointIndex)>,
    ) -> (String, EndpointIndex) {
        let cache_key = (instance.id.clone(), port_ref.port.clone(), port_ref.is_output);
        if let Some((node, idx)) = endpoint_cache.get(&cache_key) {
            return (node.clone(), *idx);
        }

        let node = instance.device.node_id.clone();
        let plan = route_plans.entry(node.clone()).or_insert_with(|| FlowRoutePlan::new(node.clone()));
        let name = format!("{}.{}", instance.id, port_ref.port);
        let idx = plan.push_endpoint(EndpointDesc::queue(name, instance.device.clone()));
        endpoint_cache.insert(cache_key, (node.clone(), idx));
        (node, idx)
    }

    fn bind(
        &self,
        producer: &(String, Resolved),
        consumer: (&str, EndpointIndex),
        route_plans: &mut HashMap<String, FlowRoutePlan>,
        tag_cache: &mut HashMap<(String, EndpointIndex, String), (EndpointIndex, EndpointIndex)>,
    ) -> Result<()> {
        let (producer_node, resolved) = producer;
        let (consumer_node, consumer_idx) = consumer;

        if producer_node == consumer_node {
            let plan = plan_for_mut(route_plans, producer_node)?;
            plan.before_load_bindings.push(Binding {
                src: resolved.index,
                dst: consumer_idx,
            });
            return Ok(());
        }

        let tag_key = (producer_node.clone(), resolved.index, consumer_node.to_string());
        let (tag_out_idx, tag_in_idx) = if let Some(cached) = tag_cache.get(&tag_key) {
            *cached
        } else {
            let producer_device = plan_for(route_plans, producer_node)?.endpoints[resolved.index].device.clone();
            let consumer_device = plan_for(route_plans, consumer_node)?.endpoints[consumer_idx].device.clone();
            let hcom_handle = hcom_handle_for(&producer_device, &consumer_device);

            let tag_out = EndpointDesc {
                kind: crate::route::EndpointKind::Tag,
                name: format!("tag.out.{}.{}", producer_node, tag_cache.len()),
                device: producer_device,
                queue_attrs: None,
                tag_attrs: Some(TagAttrs {
                    tag_id: tag_cache.len() as u32,
                    peer_tag_id: tag_cache.len() as u32,
                    rank_id: 0,
                    peer_rank_id: 1,
                    depth: 1,
                    hcom_handle: Some(hcom_handle.clone()),
                }),
                group_members: Vec::new(),
            };
            let tag_in = EndpointDesc {
                kind: crate::route::EndpointKind::Tag,
                name: format!("tag.in.{}.{}", consumer_node, tag_cache.len()),
                device: consumer_device,
                queue_attrs: None,
                tag_attrs: Some(TagAttrs {
                    tag_id: tag_cache.len() as u32,
                    peer_tag_id: tag_cache.len() as u32,
                    rank_id: 1,
                    peer_rank_id: 0,
                    depth: 1,
                    hcom_handle: Some(hcom_handle),
                }),
                group_members: Vec::new(),
            };

            let tag_out_idx = plan_for_mut(route_plans, producer_node)?.push_endpoint(tag_out);
            let tag_in_idx = plan_for_mut(route_plans, consumer_node)?.push_endpoint(tag_in);
            tag_cache.insert(tag_key, (tag_out_idx, tag_in_idx));
            (tag_out_idx, tag_in_idx)
        };

        plan_for_mut(route_plans, producer_node)?.before_load_bindings.push(Binding {
            src: resolved.index,
            dst: tag_out_idx,
        });
        // The inbound hop (tag_in -> consumer queue) is not a gateway
        // Binding: a Tag's rank_id/peer_rank_id already pin it to its
        // local queue, and binding sources are restricted to
        // Queue/RefQueue kinds (Invariant 2). tag_in still exists as an
        // endpoint in the consumer's plan so the exchange route engine
        // creates it and the rank table wires it to consumer_idx.
        Ok(())
    }

    fn register_dynamic_candidate(
        &self,
        model: &FlowModel,
        consumer_submodel: &Submodel,
        consumer_ref: &PortRef,
        consumer_instance: &Instance,
        dynamic_sched_index: &mut DynamicSchedIndex,
    ) {
        let key = LogicalGroupKey {
            model_uuid: model.name.clone(),
            logic_group_id: logic_group_id_for(&consumer_ref.port),
        };
        let candidate = RouteCandidate {
            route_label: key.logic_group_id as u64,
            target: format!("{}.{}", consumer_instance.id, consumer_ref.port),
            device: consumer_instance.device.clone(),
        };
        let existing = dynamic_sched_index.get(&key).cloned();
        let mut info = existing.unwrap_or(DstGroupInfo {
            routes: Vec::new(),
            group_size: 1,
        });
        info.routes.push(candidate);
        info.group_size = consumer_submodel.priority().max(1) as usize;
        dynamic_sched_index.insert(key, info);
    }

    /// Register the hcom rank-table rows and comm-group membership for
    /// a fan-in/fan-out group's member devices, one rank per member in
    /// iteration order.
    fn register_comm_group(
        &self,
        submodel: &str,
        port: &str,
        devices: &[DeviceInfo],
        rank_table: &mut Vec<RankTableEntry>,
        comm_groups: &mut HashMap<String, Vec<DeviceInfo>>,
    ) {
        let group_name = format!("{submodel}.{port}.group");
        for (rank_id, device) in devices.iter().enumerate() {
            rank_table.push(RankTableEntry {
                device: device.clone(),
                rank_id: rank_id as u32,
                group_name: group_name.clone(),
            });
        }
        comm_groups.insert(group_name, devices.to_vec());
    }
}

/// Look up a node's route plan, erroring instead of panicking if a
/// caller's earlier resolution step didn't actually populate it.
fn plan_for<'a>(route_plans: &'a HashMap<String, FlowRoutePlan>, node: &str) -> Result<&'a FlowRoutePlan> {
    route_plans.get(node).ok_or_else(|| Error::DeployFailed {
        step: "ResolveFlowRoutePlans",
        reason: format!("node {node} plan missing"),
    })
}

/// Mutable counterpart of [`plan_for`].
fn plan_for_mut<'a>(route_plans: &'a mut HashMap<String, FlowRoutePlan>, node: &str) -> Result<&'a mut FlowRoutePlan> {
    route_plans.get_mut(node).ok_or_else(|| Error::DeployFailed {
        step: "ResolveFlowRoutePlans",
        reason: format!("node {node} plan missing"),
    })
}

/// Deterministic hcom handle name for a device pair, independent of
/// which side calls it, so both endpoints agree on the same handle.
fn hcom_handle_for(a: &DeviceInfo, b: &DeviceInfo) -> String {
    let (lo, hi) = if a.canonical_form() <= b.canonical_form() { (a, b) } else { (b, a) };
    format!("hcom:{}:{}", lo.canonical_form(), hi.canonical_form())
}

/// Derive a stable logic-group id from a port name. Collisions across
/// unrelated port names are acceptable: the dynamic-sched index is keyed
/// on `(model_uuid, logic_group_id)`, and within one model a consumer's
/// port name is effectively unique for this purpose.
fn logic_group_id_for(port: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in port.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCapability, DeviceType};
    use crate::model::{LoadMode, Port};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeResourceManager {
        node_id: String,
        next_device_id: AtomicU32,
        pinned: Mutex<HashMap<String, DeviceInfo>>,
    }

    impl FakeResourceManager {
        fn new(node_id: &str) -> Self {
            Self {
                node_id: node_id.to_string(),
                next_device_id: AtomicU32::new(0),
                pinned: Mutex::new(HashMap::new()),
            }
        }
    }

    impl ResourceManager for FakeResourceManager {
        fn local_node_id(&self) -> &str {
            &self.node_id
        }

        fn devices(&self) -> Vec<DeviceCapability> {
            Vec::new()
        }

        fn allocate(&self, engine: Engine, pinned_device: Option<&str>) -> Result<DeviceInfo> {
            let device_type = if engine == Engine::Cpu { DeviceType::Cpu } else { DeviceType::Npu };
            if let Some(pin) = pinned_device {
                let mut pinned = self.pinned.lock().expect("lock poisoned");
                if let Some(device) = pinned.get(pin) {
                    return Ok(device.clone());
                }
                let id = self.next_device_id.fetch_add(1, Ordering::SeqCst);
                let device = DeviceInfo::new(device_type, &self.node_id, id);
                pinned.insert(pin.to_string(), device.clone());
                return Ok(device);
            }
            let id = self.next_device_id.fetch_add(1, Ordering::SeqCst);
            Ok(DeviceInfo::new(device_type, &self.node_id, id))
        }
    }

    fn port(name: &str) -> Port {
        Port {
            name: name.to_string(),
            data_type: "tensor".to_string(),
        }
    }

    fn submodel(name: &str, inputs: &[&str], outputs: &[&str], replica_count: u32, load_mode: LoadMode) -> Submodel {
        Submodel {
            name: name.to_string(),
            engine: Engine::Npu,
            inputs: inputs.iter().map(|p| port(p)).collect(),
            outputs: outputs.iter().map(|p| port(p)).collect(),
            replica_count,
            load_mode,
            scope: String::new(),
            attributes: HashMap::new(),
            proxy_controlled: false,
            host_exec_flag: false,
        }
    }

    #[test]
    fn same_node_static_edge_binds_directly() {
        let mut model = FlowModel::new("m");
        model.add_submodel(submodel("pc1", &[], &["out"], 1, LoadMode::Static)).unwrap();
        model.add_submodel(submodel("pc2", &["in"], &[], 1, LoadMode::Static)).unwrap();
        model.connect("pc1", "out", "pc2", "in").unwrap();

        let rm = FakeResourceManager::new("node-0");
        let plan = DeploymentPlanner::new(&rm).plan(&model).unwrap();

        assert_eq!(plan.assignment.len(), 2);
        let route = plan.route_plans.get("node-0").unwrap();
        assert_eq!(route.endpoints.len(), 2);
        assert_eq!(route.before_load_bindings.len(), 1);
    }

    #[test]
    fn replica_fan_in_produces_group_endpoint() {
        let mut model = FlowModel::new("m");
        model.add_submodel(submodel("pc1", &[], &["out"], 2, LoadMode::Static)).unwrap();
        model.add_submodel(submodel("pc2", &["in"], &[], 1, LoadMode::Static)).unwrap();
        model.connect("pc1", "out", "pc2", "in").unwrap();

        let rm = FakeResourceManager::new("node-0");
        let plan = DeploymentPlanner::new(&rm).plan(&model).unwrap();

        assert!(plan.assignment.contains_key("pc1#0"));
        assert!(plan.assignment.contains_key("pc1#1"));
        let route = plan.route_plans.get("node-0").unwrap();
        let groups: Vec<_> = route
            .endpoints
            .iter()
            .filter(|e| e.kind == crate::route::EndpointKind::Group)
            .collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_members.len(), 2);
    }

    #[test]
    fn dynamic_consumer_registers_in_dynamic_sched_index_not_as_binding() {
        let mut model = FlowModel::new("m");
        model.add_submodel(submodel("pc1", &[], &["out"], 1, LoadMode::Static)).unwrap();
        model.add_submodel(submodel("pc2", &["in"], &[], 1, LoadMode::Dynamic)).unwrap();
        model.connect("pc1", "out", "pc2", "in").unwrap();

        let rm = FakeResourceManager::new("node-0");
        let plan = DeploymentPlanner::new(&rm).plan(&model).unwrap();

        assert!(!plan.dynamic_sched_index.is_empty());
        let route = plan.route_plans.get("node-0").unwrap();
        assert!(route.before_load_bindings.is_empty());
    }

    #[test]
    fn var_memory_requirements_sum_per_device() {
        let mut model = FlowModel::new("m");
        let mut sm = submodel("pc1", &[], &["out"], 1, LoadMode::Static);
        sm.attributes.insert("var_memory_bytes".to_string(), "4096".to_string());
        model.add_submodel(sm).unwrap();

        let rm = FakeResourceManager::new("node-0");
        let plan = DeploymentPlanner::new(&rm).plan(&model).unwrap();
        assert_eq!(plan.var_memory_requirements.len(), 1);
        assert_eq!(plan.var_memory_requirements[0].bytes, 4096);
    }
}

//! [`ExchangeRouteEngine`]: turns a [`FlowRoutePlan`] into a realized
//! [`ExchangeRoute`] through `PreDeploy`/`Deploy`/`Undeploy`, and applies
//! exception updates on device failure.

use crate::device::DeviceStateList;
use crate::error::Result;
use crate::exchange::gateway::GatewayClient;
use crate::exchange::{ExchangeEndpoint, ExchangeRoute, PhysicalId, RoutingPair};
use crate::route::{Binding, EndpointIndex, EndpointKind, FlowRoutePlan, QueueMode};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Materializes `FlowRoutePlan`s into `ExchangeRoute`s via a
/// `GatewayClient`.
pub struct ExchangeRouteEngine {
    gateway: Arc<dyn GatewayClient>,
}

impl ExchangeRouteEngine {
    /// Construct an engine backed by the given gateway client.
    #[must_use]
    pub fn new(gateway: Arc<dyn GatewayClient>) -> Self {
        Self { gateway }
    }

    /// `PreDeploy`: resolve queue modes, create every endpoint, and
    /// install before-load bindings. Idempotent; may be called once
    /// before model load.
    pub async fn pre_deploy(&self, plan: &mut FlowRoutePlan) -> Result<ExchangeRoute> {
        plan.resolve_queue_modes();
        plan.validate()?;

        let mut route = ExchangeRoute::new(plan.node_id.clone());

        for (idx, endpoint) in plan.endpoints.iter().enumerate() {
            let physical_id = match endpoint.kind {
                EndpointKind::RefQueue => {
                    let ref_index = endpoint
                        .queue_attrs
                        .as_ref()
                        .and_then(|a| a.ref_index)
                        .ok_or_else(|| {
                            crate::error::Error::ParamInvalid(format!(
                                "RefQueue {idx} missing ref_index after validation"
                            ))
                        })?;
                    let referent = route.endpoints.get(&ref_index).ok_or_else(|| {
                        crate::error::Error::ParamInvalid(format!(
                            "RefQueue {idx} referent {ref_index} not yet materialized"
                        ))
                    })?;
                    referent.physical_id.clone()
                }
                EndpointKind::Group => {
                    let member_ids: Vec<PhysicalId> = endpoint
                        .group_members
                        .iter()
                        .map(|m| {
                            route
                                .endpoints
                                .get(m)
                                .map(|e| e.physical_id.clone())
                                .ok_or_else(|| {
                                    crate::error::Error::ParamInvalid(format!(
                                        "Group {idx} member {m} not yet materialized"
                                    ))
                                })
                        })
                        .collect::<Result<_>>()?;
                    self.gateway.create_group(&member_ids).await?
                }
                _ => self.gateway.create_endpoint(endpoint).await?,
            };

            route.endpoints.insert(
                idx,
                ExchangeEndpoint {
                    kind: endpoint.kind,
                    device: endpoint.device.clone(),
                    physical_id,
                    members: endpoint.group_members.clone(),
                },
            );
            route.live.insert(idx, true);
        }

        for binding in &plan.before_load_bindings {
            self.install_binding(&mut route, binding).await?;
        }

        info!(
            node = %plan.node_id,
            endpoints = plan.endpoints.len(),
            bindings = plan.before_load_bindings.len(),
            "pre_deploy complete"
        );
        Ok(route)
    }

    /// `Deploy`: install after-load bindings once executors report
    /// their queues up.
    pub async fn deploy(&self, plan: &FlowRoutePlan, route: &mut ExchangeRoute) -> Result<()> {
        for binding in &plan.after_load_bindings {
            self.install_binding(route, binding).await?;
        }
        info!(node = %plan.node_id, "deploy complete");
        Ok(())
    }

    async fn install_binding(&self, route: &mut ExchangeRoute, binding: &Binding) -> Result<()> {
        let src = route
            .endpoints
            .get(&binding.src)
            .ok_or_else(|| crate::error::Error::ParamInvalid("unknown binding src".into()))?
            .physical_id
            .clone();
        let dst = route
            .endpoints
            .get(&binding.dst)
            .ok_or_else(|| crate::error::Error::ParamInvalid("unknown binding dst".into()))?
            .physical_id
            .clone();
        self.gateway.bind(&src, &dst).await?;
        route.queue_routes.push(RoutingPair {
            src: binding.src,
            dst: binding.dst,
        });
        debug!(src = binding.src, dst = binding.dst, "binding installed");
        Ok(())
    }

    /// `Undeploy`: unbind all pairs, destroy groups, destroy queues.
    /// Tags are not destroyed; their hcom lifetime is managed separately.
    pub async fn undeploy(&self, route: &mut ExchangeRoute) -> Result<()> {
        for pair in route.queue_routes.drain(..) {
            if let (Some(src), Some(dst)) = (route.endpoints.get(&pair.src), route.endpoints.get(&pair.dst)) {
                self.gateway.unbind(&src.physical_id, &dst.physical_id).await?;
            }
        }

        let indices: Vec<EndpointIndex> = route.endpoints.keys().copied().collect();
        for idx in indices {
            let endpoint = route.endpoints.get(&idx).cloned();
            let Some(endpoint) = endpoint else { continue };
            match endpoint.kind {
                EndpointKind::Group => {
                    self.gateway.destroy_group(&endpoint.physical_id).await?;
                }
                EndpointKind::Tag => {
                    // Tags are not destroyed here; hcom lifetime is managed separately.
                }
                _ => {
                    self.gateway.destroy_endpoint(&endpoint.physical_id).await?;
                }
            }
            route.live.insert(idx, false);
        }
        route.endpoints.clear();
        info!(node = %route.node_id, "undeploy complete");
        Ok(())
    }

    /// Exception update: given a set of failed devices, mark endpoints
    /// on failed devices as to-delete, fully fail a Group only when
    /// every member is on a failed device, and split remaining pairs
    /// into "remove" (at least one to-delete endpoint) vs "reroute"
    /// (both endpoints live but at least one side unreachable).
    pub async fn update_exception_routes(
        &self,
        route: &mut ExchangeRoute,
        states: &DeviceStateList,
    ) -> Result<()> {
        let mut to_delete: Vec<EndpointIndex> = Vec::new();

        for (idx, endpoint) in &route.endpoints {
            let failed = match endpoint.kind {
                EndpointKind::Tag => !states.is_healthy(&endpoint.device),
                EndpointKind::Group => endpoint
                    .members
                    .iter()
                    .all(|m| route.endpoints.get(m).map_or(true, |e| !states.is_healthy(&e.device))),
                _ => !states.is_healthy(&endpoint.device),
            };
            if failed {
                to_delete.push(*idx);
            }
        }

        let to_delete_set: std::collections::HashSet<_> = to_delete.iter().copied().collect();

        // Groups that survive (not fully failed) but lost at least one
        // member: still-living, but the route through the dead member
        // is now unreachable. When exactly one member survives, elide
        // the group down to that member (per §4.1 "a group with
        // exactly one member is elided") by rerouting every pair that
        // references the group to the survivor's physical id; any other
        // residual membership is left to the gateway's own group
        // bookkeeping, since no member-removal call exists on
        // `GatewayClient` short of recreating the group outright.
        let shrunk_to_one: Vec<(EndpointIndex, PhysicalId, PhysicalId)> = route
            .endpoints
            .iter()
            .filter(|(idx, endpoint)| endpoint.kind == EndpointKind::Group && !to_delete_set.contains(idx))
            .filter_map(|(idx, endpoint)| {
                let survivors: Vec<EndpointIndex> =
                    endpoint.members.iter().copied().filter(|m| !to_delete_set.contains(m)).collect();
                if survivors.len() != 1 || survivors.len() == endpoint.members.len() {
                    return None;
                }
                let member_physical = route.endpoints.get(&survivors[0])?.physical_id.clone();
                Some((*idx, endpoint.physical_id.clone(), member_physical))
            })
            .collect();

        for (idx, old_physical, new_physical) in &shrunk_to_one {
            for pair in &route.queue_routes {
                if pair.src == *idx {
                    if let Some(dst) = route.endpoints.get(&pair.dst) {
                        self.gateway.reroute(&dst.physical_id, old_physical, new_physical).await?;
                    }
                } else if pair.dst == *idx {
                    if let Some(src) = route.endpoints.get(&pair.src) {
                        self.gateway.reroute(&src.physical_id, old_physical, new_physical).await?;
                    }
                }
            }
            warn!(group = *idx, "group reduced to one member, rerouted to survivor");
            if let Some(endpoint) = route.endpoints.get_mut(idx) {
                endpoint.physical_id = new_physical.clone();
                endpoint.members.retain(|m| !to_delete_set.contains(m));
            }
        }

        let shrunk_ids: std::collections::HashSet<EndpointIndex> =
            shrunk_to_one.iter().map(|(idx, _, _)| *idx).collect();

        // Groups that are neither fully failed nor reduced to a single
        // survivor (two or more members survive): prune the dead
        // members in place, per §4.2 "a Group is fully failed only
        // when all of its members are on failed devices; otherwise
        // only the failed members are deleted".
        for (idx, endpoint) in route.endpoints.iter_mut() {
            if endpoint.kind != EndpointKind::Group {
                continue;
            }
            if to_delete_set.contains(idx) || shrunk_ids.contains(idx) {
                continue;
            }
            endpoint.members.retain(|m| !to_delete_set.contains(m));
        }

        let mut remaining = Vec::new();
        for pair in route.queue_routes.drain(..) {
            if to_delete_set.contains(&pair.src) || to_delete_set.contains(&pair.dst) {
                if let (Some(src), Some(dst)) =
                    (route.endpoints.get(&pair.src), route.endpoints.get(&pair.dst))
                {
                    let _ = self.gateway.unbind(&src.physical_id, &dst.physical_id).await;
                }
                warn!(src = pair.src, dst = pair.dst, "route removed on device failure");
            } else {
                remaining.push(pair);
            }
        }
        route.queue_routes = remaining;

        for idx in &to_delete {
            if let Some(endpoint) = route.endpoints.get_mut(idx) {
                if let EndpointKind::Group = endpoint.kind {
                    endpoint.members.retain(|m| {
                        route
                            .live
                            .get(m)
                            .copied()
                            .unwrap_or(false)
                    });
                }
            }
            route.live.insert(*idx, false);
            route.endpoints.remove(idx);
        }

        Ok(())
    }

    /// Whether the endpoint's queue mode matches "binding source" per
    /// the Invariant 2 check (exposed for test/verification code).
    #[must_use]
    pub fn is_push(plan: &FlowRoutePlan, idx: EndpointIndex) -> bool {
        plan.endpoints
            .get(idx)
            .and_then(|e| e.queue_attrs.as_ref())
            .map(|a| a.mode == QueueMode::Push)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceInfo, DeviceType};
    use crate::route::EndpointDesc;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingGateway {
        next_id: AtomicU64,
        binds: Mutex<Vec<(PhysicalId, PhysicalId)>>,
        unbinds: Mutex<Vec<(PhysicalId, PhysicalId)>>,
    }

    #[async_trait]
    impl GatewayClient for RecordingGateway {
        async fn create_endpoint(&self, _endpoint: &EndpointDesc) -> Result<PhysicalId> {
            Ok(PhysicalId::Queue(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }
        async fn destroy_endpoint(&self, _physical_id: &PhysicalId) -> Result<()> {
            Ok(())
        }
        async fn create_group(&self, _members: &[PhysicalId]) -> Result<PhysicalId> {
            Ok(PhysicalId::Group(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }
        async fn destroy_group(&self, _group: &PhysicalId) -> Result<()> {
            Ok(())
        }
        async fn bind(&self, src: &PhysicalId, dst: &PhysicalId) -> Result<()> {
            self.binds.lock().push((src.clone(), dst.clone()));
            Ok(())
        }
        async fn unbind(&self, src: &PhysicalId, dst: &PhysicalId) -> Result<()> {
            self.unbinds.lock().push((src.clone(), dst.clone()));
            Ok(())
        }
        async fn reroute(&self, _src: &PhysicalId, _old: &PhysicalId, _new: &PhysicalId) -> Result<()> {
            Ok(())
        }
    }

    fn device() -> DeviceInfo {
        DeviceInfo::new(DeviceType::Npu, "node-0", 0)
    }

    #[tokio::test]
    async fn pre_deploy_then_undeploy_balances_creates_and_destroys() {
        let gateway = Arc::new(RecordingGateway::default());
        let engine = ExchangeRouteEngine::new(gateway.clone());

        let mut plan = FlowRoutePlan::new("node-0");
        let src = plan.push_endpoint(EndpointDesc::queue("q0", device()));
        let dst = plan.push_endpoint(EndpointDesc::queue("q1", device()));
        plan.before_load_bindings.push(Binding { src, dst });

        let mut route = engine.pre_deploy(&mut plan).await.unwrap();
        assert_eq!(route.queue_routes.len(), 1);
        assert_eq!(gateway.binds.lock().len(), 1);

        engine.undeploy(&mut route).await.unwrap();
        assert_eq!(gateway.unbinds.lock().len(), 1);
        assert!(route.queue_routes.is_empty());
        assert!(route.endpoints.is_empty());
    }

    #[tokio::test]
    async fn exception_update_removes_routes_on_failed_device() {
        let gateway = Arc::new(RecordingGateway::default());
        let engine = ExchangeRouteEngine::new(gateway.clone());

        let failed_device = DeviceInfo::new(DeviceType::Npu, "node-1", 1);
        let mut plan = FlowRoutePlan::new("node-0");
        let src = plan.push_endpoint(EndpointDesc::queue("q0", device()));
        let dst = plan.push_endpoint(EndpointDesc::queue("q1", failed_device.clone()));
        plan.before_load_bindings.push(Binding { src, dst });

        let mut route = engine.pre_deploy(&mut plan).await.unwrap();
        assert_eq!(route.queue_routes.len(), 1);

        let mut states = DeviceStateList::new();
        states.set_healthy(failed_device, false);

        engine.update_exception_routes(&mut route, &states).await.unwrap();
        assert!(route.queue_routes.is_empty());
        assert!(!route.endpoints.contains_key(&dst));
        assert!(route.endpoints.contains_key(&src));
    }

    #[tokio::test]
    async fn group_with_one_of_three_members_failed_prunes_member_not_group() {
        let gateway = Arc::new(RecordingGateway::default());
        let engine = ExchangeRouteEngine::new(gateway.clone());

        let failed_device = DeviceInfo::new(DeviceType::Npu, "node-1", 1);
        let mut plan = FlowRoutePlan::new("node-0");
        let m0 = plan.push_endpoint(EndpointDesc::queue("q0", device()));
        let m1 = plan.push_endpoint(EndpointDesc::queue("q1", failed_device.clone()));
        let m2 = plan.push_endpoint(EndpointDesc::queue("q2", device()));
        let group = plan.push_endpoint(EndpointDesc::group("g0", device(), vec![m0, m1, m2]));

        let mut route = engine.pre_deploy(&mut plan).await.unwrap();

        let mut states = DeviceStateList::new();
        states.set_healthy(failed_device, false);

        engine.update_exception_routes(&mut route, &states).await.unwrap();

        let group_endpoint = route.endpoints.get(&group).expect("group survives partial failure");
        assert_eq!(group_endpoint.members, vec![m0, m2]);
        assert!(!route.endpoints.contains_key(&m1));
    }
}

#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests for the exchange route data model.
//!
//! These check the invariants in spec §8 that must hold for *any*
//! well-formed `FlowRoutePlan`, not just the handful of topologies the
//! unit tests in `route.rs` hand-build:
//!
//! 1. Binding-source resolution: every endpoint appearing as a binding
//!    source resolves to `QueueMode::Push`; every other queue resolves
//!    to `QueueMode::Pull` (§8 Invariant 2).
//! 2. RefQueue resolution: a RefQueue endpoint's `ref_index` always
//!    names an earlier Queue endpoint in the same plan (§8 Invariant 3).

use hetero_deploy::device::{DeviceInfo, DeviceType};
use hetero_deploy::route::{Binding, EndpointDesc, FlowRoutePlan, QueueMode};
use proptest::prelude::*;
use std::collections::HashSet;

fn device() -> DeviceInfo {
    DeviceInfo::new(DeviceType::Npu, "node-0", 0)
}

/// A plan of `n` plain Queue endpoints plus an arbitrary subset of
/// `(src, dst)` index pairs installed as before-load bindings.
fn arb_queue_plan_with_bindings() -> impl Strategy<Value = (FlowRoutePlan, Vec<(usize, usize)>)> {
    (2usize..12).prop_flat_map(|n| {
        let pair = (0..n, 0..n);
        (Just(n), prop::collection::vec(pair, 0..(n * 2)))
    }).prop_map(|(n, pairs)| {
        let mut plan = FlowRoutePlan::new("node-0");
        for i in 0..n {
            plan.push_endpoint(EndpointDesc::queue(format!("q{i}"), device()));
        }
        let bindings: Vec<(usize, usize)> = pairs.into_iter().filter(|(src, dst)| src != dst).collect();
        for (src, dst) in &bindings {
            plan.before_load_bindings.push(Binding { src: *src, dst: *dst });
        }
        (plan, bindings)
    })
}

proptest! {
    /// Property: after `resolve_queue_modes`, an endpoint is Push iff it
    /// appears as a binding source in either binding list, and the plan
    /// validates cleanly.
    #[test]
    fn prop_binding_sources_resolve_to_push((mut plan, bindings) in arb_queue_plan_with_bindings()) {
        plan.resolve_queue_modes();

        let sources: HashSet<usize> = bindings.iter().map(|(src, _)| *src).collect();
        for (idx, endpoint) in plan.endpoints.iter().enumerate() {
            let mode = endpoint.queue_attrs.as_ref().unwrap().mode;
            if sources.contains(&idx) {
                prop_assert_eq!(mode, QueueMode::Push);
            } else {
                prop_assert_eq!(mode, QueueMode::Pull);
            }
        }
        prop_assert!(plan.validate().is_ok());
    }

    /// Property: a RefQueue endpoint appended after `k` Queue endpoints,
    /// pointing at any of them, always validates; pointing at itself or
    /// forward never does.
    #[test]
    fn prop_ref_queue_validates_iff_points_backward(
        k in 1usize..8,
        ref_offset in 0usize..16,
    ) {
        let mut plan = FlowRoutePlan::new("node-0");
        for i in 0..k {
            plan.push_endpoint(EndpointDesc::queue(format!("q{i}"), device()));
        }
        let ref_index = ref_offset % (k + 1);
        plan.push_endpoint(EndpointDesc::ref_queue("r0", device(), ref_index, 0));
        plan.resolve_queue_modes();

        let result = plan.validate();
        if ref_index < k {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    }
}

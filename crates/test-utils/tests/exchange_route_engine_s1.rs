//! End-to-end exercise of `ExchangeRouteEngine` over the S1 canonical
//! topology (`data -> PC1 -> PC2 -> NetOutput`, single node, no groups),
//! using the shared fixtures this crate provides.

use hetero_deploy::device::{DeviceInfo, DeviceType};
use hetero_deploy::exchange::ExchangeRouteEngine;
use hetero_deploy::route::{Binding, EndpointDesc, FlowRoutePlan};
use hetero_deploy_test_utils::{model_builders::simple_fan_in_pipeline, RecordingGateway};
use std::sync::Arc;

fn device() -> DeviceInfo {
    DeviceInfo::new(DeviceType::Npu, "node-0", 0)
}

#[tokio::test]
async fn simple_fan_in_pipeline_deploys_and_undeploys_cleanly() {
    let model = simple_fan_in_pipeline();
    assert_eq!(model.submodel_count(), 2);

    // The planner's full placement/route-plan construction is exercised
    // in `hetero-deploy::planner`'s own tests; here we drive the realized
    // FlowRoutePlan an S1-shaped model would produce straight through the
    // exchange route engine, to exercise Invariant 2 and Invariant 4
    // end-to-end against the recording gateway fixture.
    let gateway = Arc::new(RecordingGateway::new());
    let engine = ExchangeRouteEngine::new(gateway.clone());

    let mut plan = FlowRoutePlan::new("node-0");
    let data_in = plan.push_endpoint(EndpointDesc::queue("data", device()));
    let pc1_out = plan.push_endpoint(EndpointDesc::queue("pc1_out", device()));
    let net_out = plan.push_endpoint(EndpointDesc::queue("net_out", device()));
    plan.before_load_bindings.push(Binding { src: data_in, dst: pc1_out });
    plan.before_load_bindings.push(Binding { src: pc1_out, dst: net_out });

    let mut route = engine.pre_deploy(&mut plan).await.unwrap();
    assert_eq!(route.queue_routes.len(), 2);
    assert_eq!(gateway.binds().len(), 2);

    engine.deploy(&plan, &mut route).await.unwrap();

    engine.undeploy(&mut route).await.unwrap();
    assert_eq!(gateway.unbinds().len(), 2);
    assert!(route.queue_routes.is_empty());
    assert!(route.endpoints.is_empty());
}

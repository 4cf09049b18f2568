//! `FlowModel` builders for the canonical topologies used across the
//! workspace's end-to-end tests, grounded on spec.md's S1/S2 scenarios.

use hetero_deploy::model::{Engine, FlowModel, LoadMode, Port, Submodel};

fn port(name: &str) -> Port {
    Port {
        name: name.to_string(),
        data_type: "tensor".to_string(),
    }
}

fn submodel(name: &str, engine: Engine, inputs: &[&str], outputs: &[&str], replica_count: u32) -> Submodel {
    Submodel {
        name: name.to_string(),
        engine,
        inputs: inputs.iter().map(|p| port(p)).collect(),
        outputs: outputs.iter().map(|p| port(p)).collect(),
        replica_count,
        load_mode: LoadMode::Static,
        scope: String::new(),
        attributes: std::collections::HashMap::new(),
        proxy_controlled: false,
        host_exec_flag: false,
    }
}

/// S1: `data -> PC1 -> PC2 -> NetOutput`, a simple single-node fan-in
/// pipeline with no replication and no dynamic-sched groups.
#[must_use]
pub fn simple_fan_in_pipeline() -> FlowModel {
    let mut model = FlowModel::new("s1-fan-in");
    model
        .add_submodel(submodel("PC1", Engine::Npu, &["data"], &["out"], 1))
        .expect("PC1 registration cannot fail on an empty model");
    model
        .add_submodel(submodel("PC2", Engine::Npu, &["in"], &["net_out"], 1))
        .expect("PC2 registration cannot fail with a unique name");
    model
        .connect("PC1", "out", "PC2", "in")
        .expect("both ports were just registered");
    model
}

/// S2: `data -> {PC1@0, PC1@1} -> PC2 -> NetOutput`, two replicas of
/// PC1 feeding a single PC2 consumer; the planner must emit a group of
/// two for PC1's output.
#[must_use]
pub fn two_replica_fan_in() -> FlowModel {
    let mut model = FlowModel::new("s2-two-replica-fan-in");
    model
        .add_submodel(submodel("PC1", Engine::Npu, &["data"], &["out"], 2))
        .expect("PC1 registration cannot fail on an empty model");
    model
        .add_submodel(submodel("PC2", Engine::Npu, &["in"], &["net_out"], 1))
        .expect("PC2 registration cannot fail with a unique name");
    model
        .connect("PC1", "out", "PC2", "in")
        .expect("both ports were just registered");
    model
}

/// A single dynamic-sched submodel feeding a fixed consumer, used for
/// dynamic-routing cache-hit/cache-miss tests (S4).
#[must_use]
pub fn dynamic_sched_pipeline() -> FlowModel {
    let mut model = FlowModel::new("s4-dynamic-sched");
    let mut producer = submodel("Router", Engine::Npu, &["data"], &["out"], 3);
    producer.load_mode = LoadMode::Dynamic;
    model
        .add_submodel(producer)
        .expect("Router registration cannot fail on an empty model");
    model
        .add_submodel(submodel("Sink", Engine::Npu, &["in"], &[], 1))
        .expect("Sink registration cannot fail with a unique name");
    model
        .connect("Router", "out", "Sink", "in")
        .expect("both ports were just registered");
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_fan_in_has_two_submodels_and_one_edge() {
        let model = simple_fan_in_pipeline();
        assert_eq!(model.submodel_count(), 2);
        assert_eq!(model.relation().edge_count(), 1);
    }

    #[test]
    fn two_replica_fan_in_declares_two_pc1_replicas() {
        let model = two_replica_fan_in();
        assert_eq!(model.submodel("PC1").unwrap().replica_count, 2);
    }

    #[test]
    fn dynamic_sched_pipeline_marks_producer_dynamic() {
        let model = dynamic_sched_pipeline();
        assert_eq!(model.submodel("Router").unwrap().load_mode, LoadMode::Dynamic);
    }
}

//! Flow model data types: [`FlowModel`], [`Submodel`], and the
//! producer/consumer relation graph between submodel ports.
//!
//! The relation graph permits cycles through dynamic-sched feedback
//! ports, so it is stored as an arena of nodes addressed by
//! [`petgraph::graph::NodeIndex`] rather than owned references between
//! submodels.

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Engine a submodel executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    /// Host CPU execution.
    Cpu,
    /// Accelerator (NPU) execution.
    Npu,
    /// User-defined-function engine.
    Udf,
}

impl Engine {
    /// Resolve the engine for a submodel given its declared `model_type`
    /// and whether `HostExecFlag` is set, per the planner's step 1:
    /// default to `Npu` unless `HostExecFlag` forces host execution.
    #[must_use]
    pub fn resolve(model_type: Option<Engine>, host_exec_flag: bool) -> Engine {
        if host_exec_flag {
            return Engine::Cpu;
        }
        model_type.unwrap_or(Engine::Npu)
    }
}

/// Whether a submodel's placement/queues are fixed at deploy time or
/// may be reassigned by the dynamic-sched loop at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMode {
    /// Static: device placement and routes are fixed for the model's
    /// lifetime.
    Static,
    /// Dynamic: eligible for runtime routing decisions via
    /// `DynamicSchedIndex`.
    Dynamic,
}

/// A single typed data port on a submodel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port name, unique within its submodel and direction.
    pub name: String,
    /// Declared tensor/data type tag (opaque to the planner).
    pub data_type: String,
}

/// Engine-typed executable artifact with declared ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submodel {
    /// Name, unique within the owning [`FlowModel`].
    pub name: String,
    /// Declared engine type.
    pub engine: Engine,
    /// Declared input ports, in order.
    pub inputs: Vec<Port>,
    /// Declared output ports, in order.
    pub outputs: Vec<Port>,
    /// Number of replicas to place.
    pub replica_count: u32,
    /// Static or dynamic load mode.
    pub load_mode: LoadMode,
    /// Exception-routing scope tag; empty string is the reserved
    /// model-IO scope.
    pub scope: String,
    /// Arbitrary string attributes (user hints: pinned device, priority).
    pub attributes: HashMap<String, String>,
    /// Whether this submodel's control plane lives in a proxy process
    /// while its tensors live on device.
    pub proxy_controlled: bool,
    /// Whether `HostExecFlag` forces host (CPU) execution regardless of
    /// the declared engine.
    pub host_exec_flag: bool,
}

impl Submodel {
    /// Resolved engine, applying `HostExecFlag` per the planner's step 1.
    #[must_use]
    pub fn resolved_engine(&self) -> Engine {
        Engine::resolve(Some(self.engine), self.host_exec_flag)
    }

    /// Pinned device hint, if the caller set one via the `pinned_device`
    /// attribute.
    #[must_use]
    pub fn pinned_device(&self) -> Option<&str> {
        self.attributes.get("pinned_device").map(String::as_str)
    }

    /// Priority hint, defaulting to 0 when unset or unparsable.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.attributes
            .get("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// A node in the model relation graph: a reference to one port on one
/// submodel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    /// Owning submodel name.
    pub submodel: String,
    /// Port name.
    pub port: String,
    /// `true` for an output port (producer side), `false` for input.
    pub is_output: bool,
}

/// Directed producer-to-consumer relation graph between submodel ports.
///
/// Stored as an arena (`petgraph::DiGraph`) addressed by `NodeIndex` so
/// that cycles through dynamic-sched feedback ports are representable:
/// no node owns another, so cyclic edges never create an ownership
/// cycle in Rust's borrow model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRelation {
    graph: DiGraph<PortRef, ()>,
    index: HashMap<PortRef, NodeIndex>,
}

impl ModelRelation {
    /// Create an empty relation graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port, returning its stable index (idempotent: calling
    /// twice with an equal `PortRef` returns the same index).
    pub fn register_port(&mut self, port: PortRef) -> NodeIndex {
        if let Some(idx) = self.index.get(&port) {
            return *idx;
        }
        let idx = self.graph.add_node(port.clone());
        self.index.insert(port, idx);
        idx
    }

    /// Record a producer-to-consumer edge between two already-registered
    /// ports.
    pub fn connect(&mut self, producer: NodeIndex, consumer: NodeIndex) {
        self.graph.add_edge(producer, consumer, ());
    }

    /// All consumer ports fed directly by the given producer port.
    #[must_use]
    pub fn consumers_of(&self, producer: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(producer, petgraph::Direction::Outgoing)
            .collect()
    }

    /// All producer ports feeding the given consumer port.
    #[must_use]
    pub fn producers_of(&self, consumer: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(consumer, petgraph::Direction::Incoming)
            .collect()
    }

    /// Resolve a port's data by index.
    #[must_use]
    pub fn port(&self, idx: NodeIndex) -> Option<&PortRef> {
        self.graph.node_weight(idx)
    }

    /// Look up a port's index by value, without registering it.
    #[must_use]
    pub fn find(&self, port: &PortRef) -> Option<NodeIndex> {
        self.index.get(port).copied()
    }

    /// Number of distinct ports registered.
    #[must_use]
    pub fn port_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of producer-to-consumer edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All producer-to-consumer edges as resolved `PortRef` pairs, in
    /// unspecified order.
    #[must_use]
    pub fn edges(&self) -> Vec<(PortRef, PortRef)> {
        self.graph
            .edge_indices()
            .filter_map(|e| {
                let (src, dst) = self.graph.edge_endpoints(e)?;
                Some((self.graph.node_weight(src)?.clone(), self.graph.node_weight(dst)?.clone()))
            })
            .collect()
    }
}

/// Root container: a named set of submodels plus their relation graph.
/// Immutable once compiled; referenced by the planner and the receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowModel {
    /// Model name, used as the root-model key throughout the deploy
    /// context.
    pub name: String,
    submodels: HashMap<String, Submodel>,
    relation: ModelRelation,
}

impl FlowModel {
    /// Start building a new, empty flow model.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            submodels: HashMap::new(),
            relation: ModelRelation::new(),
        }
    }

    /// Add a submodel. Returns an error if a submodel with the same name
    /// already exists (submodel names must be unique).
    pub fn add_submodel(&mut self, submodel: Submodel) -> crate::error::Result<()> {
        if self.submodels.contains_key(&submodel.name) {
            return Err(crate::error::Error::ParamInvalid(format!(
                "duplicate submodel name: {}",
                submodel.name
            )));
        }
        for port in &submodel.inputs {
            self.relation.register_port(PortRef {
                submodel: submodel.name.clone(),
                port: port.name.clone(),
                is_output: false,
            });
        }
        for port in &submodel.outputs {
            self.relation.register_port(PortRef {
                submodel: submodel.name.clone(),
                port: port.name.clone(),
                is_output: true,
            });
        }
        self.submodels.insert(submodel.name.clone(), submodel);
        Ok(())
    }

    /// Connect a producer output port to a consumer input port. Both
    /// submodels must already have been added with the named ports.
    pub fn connect(
        &mut self,
        producer_submodel: &str,
        producer_port: &str,
        consumer_submodel: &str,
        consumer_port: &str,
    ) -> crate::error::Result<()> {
        let producer_ref = PortRef {
            submodel: producer_submodel.to_string(),
            port: producer_port.to_string(),
            is_output: true,
        };
        let consumer_ref = PortRef {
            submodel: consumer_submodel.to_string(),
            port: consumer_port.to_string(),
            is_output: false,
        };
        let producer_idx = self.relation.find(&producer_ref).ok_or_else(|| {
            crate::error::Error::ParamInvalid(format!(
                "unknown producer port {producer_submodel}.{producer_port}"
            ))
        })?;
        let consumer_idx = self.relation.find(&consumer_ref).ok_or_else(|| {
            crate::error::Error::ParamInvalid(format!(
                "unknown consumer port {consumer_submodel}.{consumer_port}"
            ))
        })?;
        self.relation.connect(producer_idx, consumer_idx);
        Ok(())
    }

    /// Look up a submodel by name.
    #[must_use]
    pub fn submodel(&self, name: &str) -> Option<&Submodel> {
        self.submodels.get(name)
    }

    /// Iterate submodels in unspecified order.
    pub fn submodels(&self) -> impl Iterator<Item = &Submodel> {
        self.submodels.values()
    }

    /// Number of submodels.
    #[must_use]
    pub fn submodel_count(&self) -> usize {
        self.submodels.len()
    }

    /// Access the relation graph (for planner traversal).
    #[must_use]
    pub fn relation(&self) -> &ModelRelation {
        &self.relation
    }

    /// Validate that every submodel's declared input/output port counts
    /// match the number of endpoints named for it in the relation graph
    /// (invariant from the data model section).
    pub fn validate_port_counts(&self) -> crate::error::Result<()> {
        for submodel in self.submodels.values() {
            for port in &submodel.inputs {
                let port_ref = PortRef {
                    submodel: submodel.name.clone(),
                    port: port.name.clone(),
                    is_output: false,
                };
                if self.relation.find(&port_ref).is_none() {
                    return Err(crate::error::Error::ParamInvalid(format!(
                        "submodel {} missing relation entry for input port {}",
                        submodel.name, port.name
                    )));
                }
            }
            for port in &submodel.outputs {
                let port_ref = PortRef {
                    submodel: submodel.name.clone(),
                    port: port.name.clone(),
                    is_output: true,
                };
                if self.relation.find(&port_ref).is_none() {
                    return Err(crate::error::Error::ParamInvalid(format!(
                        "submodel {} missing relation entry for output port {}",
                        submodel.name, port.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submodel(name: &str, inputs: &[&str], outputs: &[&str]) -> Submodel {
        Submodel {
            name: name.to_string(),
            engine: Engine::Npu,
            inputs: inputs
                .iter()
                .map(|p| Port {
                    name: (*p).to_string(),
                    data_type: "tensor".to_string(),
                })
                .collect(),
            outputs: outputs
                .iter()
                .map(|p| Port {
                    name: (*p).to_string(),
                    data_type: "tensor".to_string(),
                })
                .collect(),
            replica_count: 1,
            load_mode: LoadMode::Static,
            scope: String::new(),
            attributes: HashMap::new(),
            proxy_controlled: false,
            host_exec_flag: false,
        }
    }

    #[test]
    fn duplicate_submodel_name_rejected() {
        let mut model = FlowModel::new("m");
        model.add_submodel(submodel("a", &[], &["out"])).unwrap();
        let err = model.add_submodel(submodel("a", &[], &["out"])).unwrap_err();
        assert!(matches!(err, crate::error::Error::ParamInvalid(_)));
    }

    #[test]
    fn connect_builds_producer_consumer_edge() {
        let mut model = FlowModel::new("m");
        model.add_submodel(submodel("pc1", &["in"], &["out"])).unwrap();
        model.add_submodel(submodel("pc2", &["in"], &["out"])).unwrap();
        model.connect("pc1", "out", "pc2", "in").unwrap();
        assert_eq!(model.relation().edge_count(), 1);
    }

    #[test]
    fn engine_resolution_prefers_host_exec_flag() {
        assert_eq!(Engine::resolve(Some(Engine::Npu), true), Engine::Cpu);
        assert_eq!(Engine::resolve(None, false), Engine::Npu);
        assert_eq!(Engine::resolve(Some(Engine::Cpu), false), Engine::Cpu);
    }

    #[test]
    fn port_counts_validate_after_connect() {
        let mut model = FlowModel::new("m");
        model.add_submodel(submodel("pc1", &[], &["out"])).unwrap();
        model.add_submodel(submodel("pc2", &["in"], &[])).unwrap();
        model.connect("pc1", "out", "pc2", "in").unwrap();
        assert!(model.validate_port_counts().is_ok());
    }

    #[test]
    fn cyclic_relation_is_representable() {
        let mut model = FlowModel::new("m");
        model.add_submodel(submodel("a", &["fb"], &["out"])).unwrap();
        model.add_submodel(submodel("b", &["in"], &["fb_out"])).unwrap();
        model.connect("a", "out", "b", "in").unwrap();
        model.connect("b", "fb_out", "a", "fb").unwrap();
        assert_eq!(model.relation().edge_count(), 2);
    }
}

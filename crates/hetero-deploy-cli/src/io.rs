//! Loading the on-disk artifacts an operator hands to this CLI: the
//! flow model, the node-endpoint map used to reach remote deployers,
//! and the device inventory used by [`crate::resource_manager`].

use anyhow::{Context, Result};
use hetero_deploy::model::FlowModel;
use std::collections::HashMap;
use std::path::Path;

/// Load a [`FlowModel`] from a JSON file.
pub fn load_flow_model(path: impl AsRef<Path>) -> Result<FlowModel> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading flow model {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing flow model {}", path.display()))
}

/// Load a `node_id -> gRPC endpoint` map from a JSON file, e.g.:
/// `{"node-0": "http://localhost:7070", "node-1": "http://node-1:7070"}`.
pub fn load_node_endpoints(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading node endpoints {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing node endpoints {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_flow_model_round_trips_through_json() {
        let model = FlowModel::new("m");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, serde_json::to_string(&model).unwrap()).unwrap();
        let loaded = load_flow_model(&path).unwrap();
        assert_eq!(loaded.name, "m");
        assert_eq!(loaded.submodel_count(), 0);
    }

    #[test]
    fn load_node_endpoints_parses_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, r#"{"node-0":"http://localhost:7070"}"#).unwrap();
        let endpoints = load_node_endpoints(&path).unwrap();
        assert_eq!(endpoints.get("node-0").map(String::as_str), Some("http://localhost:7070"));
    }
}

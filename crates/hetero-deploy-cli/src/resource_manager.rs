//! [`FileResourceManager`]: a [`ResourceManager`] backed by a JSON device
//! inventory file, for operators driving the planner from the CLI
//! without a running node-local device-discovery daemon.

use hetero_deploy::device::{DeviceCapability, DeviceInfo};
use hetero_deploy::error::{Error, Result};
use hetero_deploy::model::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk device inventory: this node's id plus its device capability
/// snapshot, as produced by node-local device discovery in production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInventory {
    /// This node's identifier.
    pub node_id: String,
    /// Known devices and their capabilities.
    pub devices: Vec<DeviceCapability>,
}

impl DeviceInventory {
    /// Load a device inventory from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| Error::ParamInvalid(e.to_string()))
    }
}

/// A [`ResourceManager`] over a static device inventory loaded from
/// disk. Allocation picks the lowest-pressure device supporting the
/// requested engine (ties break by canonical form, per the planner's
/// invariant), then bumps that device's in-memory pressure counter so
/// subsequent allocations in the same process see it.
pub struct FileResourceManager {
    node_id: String,
    devices: Mutex<Vec<DeviceCapability>>,
}

impl FileResourceManager {
    /// Build a resource manager from a loaded inventory.
    #[must_use]
    pub fn new(inventory: DeviceInventory) -> Self {
        Self {
            node_id: inventory.node_id,
            devices: Mutex::new(inventory.devices),
        }
    }

    /// Load an inventory file and build a resource manager from it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(DeviceInventory::load(path)?))
    }
}

impl hetero_deploy::device::ResourceManager for FileResourceManager {
    fn local_node_id(&self) -> &str {
        &self.node_id
    }

    fn devices(&self) -> Vec<DeviceCapability> {
        self.devices.lock().clone()
    }

    fn allocate(&self, engine: Engine, pinned_device: Option<&str>) -> Result<DeviceInfo> {
        let mut devices = self.devices.lock();

        let mut candidates: Vec<usize> = devices
            .iter()
            .enumerate()
            .filter(|(_, cap)| {
                cap.supported_engines.contains(&engine)
                    && pinned_device.map_or(true, |pin| cap.device.canonical_form() == pin || cap.device.node_id == pin)
            })
            .map(|(idx, _)| idx)
            .collect();

        if candidates.is_empty() {
            return Err(Error::ParamInvalid(format!(
                "no device on node {} supports engine {engine:?}",
                self.node_id
            )));
        }

        candidates.sort_by(|&a, &b| {
            devices[a]
                .pressure
                .cmp(&devices[b].pressure)
                .then_with(|| devices[a].device.cmp(&devices[b].device))
        });
        let chosen = candidates[0];
        devices[chosen].pressure += 1;
        Ok(devices[chosen].device.clone())
    }
}

//! An in-memory [`ResourceManager`] fixture with a configurable device
//! inventory, grounded on the fake implementations embedded in
//! `hetero-deploy`'s own `#[cfg(test)]` modules (see `planner.rs`).

use hetero_deploy::device::{DeviceCapability, DeviceInfo, ResourceManager};
use hetero_deploy::error::{Error, Result};
use hetero_deploy::model::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;

/// An in-memory `ResourceManager` over a fixed device inventory,
/// tracking allocation pressure the way the real implementation would.
pub struct FakeResourceManager {
    local_node_id: String,
    devices: Mutex<HashMap<DeviceInfo, DeviceCapability>>,
}

impl FakeResourceManager {
    /// Construct a manager with no devices registered yet.
    #[must_use]
    pub fn new(local_node_id: impl Into<String>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Register a device with the given supported engines and free
    /// variable-memory budget.
    pub fn with_device(self, device: DeviceInfo, supported_engines: Vec<Engine>, free_var_memory_bytes: u64) -> Self {
        self.devices.lock().insert(
            device.clone(),
            DeviceCapability {
                device,
                npu_present: supported_engines.contains(&Engine::Npu),
                supported_engines,
                free_var_memory_bytes,
                pressure: 0,
            },
        );
        self
    }

    /// Current pressure recorded for a device, for test assertions.
    #[must_use]
    pub fn pressure_of(&self, device: &DeviceInfo) -> Option<u64> {
        self.devices.lock().get(device).map(|c| c.pressure)
    }
}

impl ResourceManager for FakeResourceManager {
    fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    fn devices(&self) -> Vec<DeviceCapability> {
        self.devices.lock().values().cloned().collect()
    }

    fn allocate(&self, engine: Engine, pinned_device: Option<&str>) -> Result<DeviceInfo> {
        let mut devices = self.devices.lock();
        let mut candidates: Vec<&mut DeviceCapability> = devices
            .values_mut()
            .filter(|cap| cap.supported_engines.contains(&engine))
            .filter(|cap| match pinned_device {
                Some(pin) => cap.device.device_id.to_string() == pin,
                None => true,
            })
            .collect();

        candidates.sort_by(|a, b| a.pressure.cmp(&b.pressure).then_with(|| a.device.canonical_form().cmp(&b.device.canonical_form())));

        let chosen = candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::ParamInvalid(format!("no device supports engine {engine:?}")))?;
        chosen.pressure += 1;
        Ok(chosen.device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetero_deploy::device::DeviceType;

    fn device(id: u32) -> DeviceInfo {
        DeviceInfo::new(DeviceType::Npu, "node-0", id)
    }

    #[test]
    fn allocate_breaks_ties_by_pressure_then_canonical_form() {
        let manager = FakeResourceManager::new("node-0")
            .with_device(device(1), vec![Engine::Npu], 1024)
            .with_device(device(0), vec![Engine::Npu], 1024);

        let first = manager.allocate(Engine::Npu, None).unwrap();
        assert_eq!(first, device(0));
        let second = manager.allocate(Engine::Npu, None).unwrap();
        assert_eq!(second, device(1));
        assert_eq!(manager.pressure_of(&device(0)), Some(1));
    }

    #[test]
    fn allocate_rejects_unsupported_engine() {
        let manager = FakeResourceManager::new("node-0").with_device(device(0), vec![Engine::Cpu], 1024);
        let err = manager.allocate(Engine::Npu, None).unwrap_err();
        assert!(matches!(err, Error::ParamInvalid(_)));
    }
}

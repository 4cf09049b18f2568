//! Device identity, capability snapshot, and the [`ResourceManager`]
//! contract the planner consults for placement.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Device type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Host CPU.
    Cpu,
    /// Accelerator NPU.
    Npu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU"),
            DeviceType::Npu => write!(f, "NPU"),
        }
    }
}

/// `(device_type, node_id, device_id)` triple. Totally ordered by
/// lexicographic string form for stable placement and tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device type (CPU/NPU).
    pub device_type: DeviceType,
    /// Owning node identifier.
    pub node_id: String,
    /// Device identifier, unique within `(device_type, node_id)`.
    pub device_id: u32,
}

impl DeviceInfo {
    /// Construct a new device identity.
    #[must_use]
    pub fn new(device_type: DeviceType, node_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            device_type,
            node_id: node_id.into(),
            device_id,
        }
    }

    /// Canonical lexicographic string form used for ordering and as a
    /// tie-break key.
    #[must_use]
    pub fn canonical_form(&self) -> String {
        format!("{}/{}/{:010}", self.device_type, self.node_id, self.device_id)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_form())
    }
}

impl PartialOrd for DeviceInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_form().cmp(&other.canonical_form())
    }
}

/// Per-device capability flags consulted by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapability {
    /// The device identity this capability record describes.
    pub device: DeviceInfo,
    /// Whether an NPU is physically present on this device.
    pub npu_present: bool,
    /// Engine kinds this device can host.
    pub supported_engines: Vec<crate::model::Engine>,
    /// Free variable-memory budget, in bytes.
    pub free_var_memory_bytes: u64,
    /// Monotonically increasing pressure counter, incremented on every
    /// allocation to this device; used as the planner's real tie-break
    /// signal (see `ResourceManager::allocate`).
    pub pressure: u64,
}

/// Read-only, node-local device inventory consulted by the planner.
/// Produced by node-local device discovery; the planner never mutates
/// it directly except through [`ResourceManager::allocate`]'s pressure
/// bookkeeping.
pub trait ResourceManager: Send + Sync {
    /// This node's identifier.
    fn local_node_id(&self) -> &str;

    /// Snapshot of all known devices and their capabilities.
    fn devices(&self) -> Vec<DeviceCapability>;

    /// Allocate a device for a submodel replica matching the given
    /// engine, optionally pinned to a specific device id string.
    ///
    /// Ties among otherwise-equal candidates break by lowest recorded
    /// `pressure`, falling back to lowest [`DeviceInfo::canonical_form`]
    /// when pressure also ties.
    fn allocate(
        &self,
        engine: crate::model::Engine,
        pinned_device: Option<&str>,
    ) -> crate::error::Result<DeviceInfo>;
}

/// Current fleet health snapshot: `DeviceInfo -> healthy?`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStateList {
    states: HashMap<DeviceInfo, bool>,
}

impl DeviceStateList {
    /// Empty device state list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a device's health.
    pub fn set_healthy(&mut self, device: DeviceInfo, healthy: bool) {
        self.states.insert(device, healthy);
    }

    /// Whether a device is known and healthy. Unknown devices are
    /// treated as healthy (absence of information is not a failure
    /// signal).
    #[must_use]
    pub fn is_healthy(&self, device: &DeviceInfo) -> bool {
        self.states.get(device).copied().unwrap_or(true)
    }

    /// All devices currently marked unhealthy.
    #[must_use]
    pub fn abnormal_devices(&self) -> Vec<DeviceInfo> {
        self.states
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(device, _)| device.clone())
            .collect()
    }

    /// Compute the set of devices that became abnormal between `self`
    /// (the cached baseline) and `updated` (the newly observed state):
    /// present as unhealthy in `updated` but not unhealthy in `self`.
    #[must_use]
    pub fn new_abnormal_since(&self, updated: &DeviceStateList) -> Vec<DeviceInfo> {
        updated
            .abnormal_devices()
            .into_iter()
            .filter(|d| self.is_healthy(d))
            .collect()
    }
}

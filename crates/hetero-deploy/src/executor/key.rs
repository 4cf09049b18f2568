//! [`ExecutorKey`]: the identity of an executor process.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Whether an executor runs in-process (as a thread) or as a separate
/// OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessMode {
    /// In-process thread.
    Thread,
    /// Separate OS process.
    Process,
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessMode::Thread => write!(f, "thread"),
            ProcessMode::Process => write!(f, "process"),
        }
    }
}

/// The identity of an executor process:
/// `(device_id, device_type, context_id, engine_name, rank_id,
/// process_id, process_mode, is_proxy)`.
///
/// No two executors share an `ExecutorKey` (data model invariant).
/// Ordering is lexicographic over a canonical string form, with the
/// `UDF` engine overriding rank and process id to a fixed placeholder
/// since UDF executors are not rank- or process-addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorKey {
    /// Owning device id.
    pub device_id: u32,
    /// Owning device type.
    pub device_type: crate::device::DeviceType,
    /// Deploy session context id.
    pub context_id: String,
    /// Engine name (matches `Submodel::engine`'s string form, plus
    /// `"UDF"` for user-defined-function executors).
    pub engine_name: String,
    /// Collective-communication rank id.
    pub rank_id: u32,
    /// OS process id (or a synthetic in-process id for `Thread` mode).
    pub process_id: i32,
    /// In-process thread vs separate OS process.
    pub process_mode: ProcessMode,
    /// Whether this executor's control plane is a proxy for tensors
    /// living on device.
    pub is_proxy: bool,
}

impl ExecutorKey {
    /// Canonical string form used for ordering. The `UDF` engine ignores
    /// rank and process id, since UDF executors are addressed purely by
    /// `(device, context, engine)`.
    #[must_use]
    pub fn canonical_form(&self) -> String {
        if self.engine_name == "UDF" {
            format!(
                "{}/{}/{}/{}",
                self.device_type, self.device_id, self.context_id, self.engine_name
            )
        } else {
            format!(
                "{}/{}/{}/{}/{}/{}",
                self.device_type,
                self.device_id,
                self.context_id,
                self.engine_name,
                self.rank_id,
                self.process_id
            )
        }
    }
}

impl fmt::Display for ExecutorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_form())
    }
}

impl PartialOrd for ExecutorKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExecutorKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_form().cmp(&other.canonical_form())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;

    fn key(engine: &str, rank: u32, pid: i32) -> ExecutorKey {
        ExecutorKey {
            device_id: 0,
            device_type: DeviceType::Npu,
            context_id: "ctx-0".into(),
            engine_name: engine.into(),
            rank_id: rank,
            process_id: pid,
            process_mode: ProcessMode::Process,
            is_proxy: false,
        }
    }

    #[test]
    fn udf_keys_ignore_rank_and_process_id() {
        let a = key("UDF", 0, 100);
        let b = key("UDF", 5, 999);
        assert_eq!(a.canonical_form(), b.canonical_form());
    }

    #[test]
    fn non_udf_keys_differ_by_rank() {
        let a = key("NPU", 0, 100);
        let b = key("NPU", 1, 100);
        assert_ne!(a.canonical_form(), b.canonical_form());
        assert!(a < b);
    }
}

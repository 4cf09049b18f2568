//! Fork/exec, death-signal, and liveness-monitoring for executor and
//! daemon subprocesses.

pub mod manager;

pub use manager::{ProcStatus, SubprocessConfig, SubprocessManager};

//! A fake subprocess harness for S3-style death-and-recovery tests: a
//! tiny `/bin/sh` invocation stands in for a real executor binary, so
//! `SubprocessManager` can be exercised without a built executor.

use hetero_deploy::subprocess::SubprocessConfig;
use std::time::Duration;

/// Build a `SubprocessConfig` for a dummy executor that sleeps for
/// `lifetime` before exiting cleanly. Used to exercise the commit-queue
/// fork path and normal-exit monitoring.
#[must_use]
pub fn long_lived_executor(lifetime: Duration) -> SubprocessConfig {
    SubprocessConfig {
        process_type: "test-executor".into(),
        executable: "/bin/sh".into(),
        args: vec!["-c".into(), format!("sleep {}", lifetime.as_secs_f64())],
        ..SubprocessConfig::default()
    }
}

/// Build a `SubprocessConfig` for a dummy executor that exits
/// immediately with the given status code, simulating a crash on
/// startup.
#[must_use]
pub fn crashing_executor(exit_code: i32) -> SubprocessConfig {
    SubprocessConfig {
        process_type: "test-executor".into(),
        executable: "/bin/sh".into(),
        args: vec!["-c".into(), format!("exit {exit_code}")],
        ..SubprocessConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetero_deploy::subprocess::SubprocessManager;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn crashing_executor_is_observed_as_nonzero_exit() {
        let manager = SubprocessManager::initialize().unwrap();
        let pid = manager.fork_subprocess(crashing_executor(7)).unwrap();

        let observed = Arc::new(AtomicBool::new(false));
        let observed_clone = observed.clone();
        manager.register_exception_handle_callback(pid, move |_pid, _status| {
            observed_clone.store(true, Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !observed.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(observed.load(Ordering::SeqCst));
        manager.finalize();
    }
}

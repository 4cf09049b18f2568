//! [`SubprocessManager`]: forks executor/daemon binaries, installs a
//! parent-death signal in the child, and monitors liveness via
//! `waitpid` on a dedicated background thread.
//!
//! `ForkSubprocess` is funneled through a single-worker commit queue:
//! forking concurrently from multiple OS threads in a process that also
//! uses threads is unsafe (only the calling thread survives `fork()` in
//! a multi-threaded process until `exec`), so every fork request is
//! serialized onto one dedicated thread regardless of how many callers
//! invoke `fork_subprocess` concurrently.

use crate::constants::SUBPROCESS_MONITOR_POLL_INTERVAL;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Status observed for a monitored child pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    /// Exited with a zero status.
    Normal,
    /// Stopped (e.g. SIGSTOP); still monitored.
    Stopped,
    /// Exited with a non-zero status.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Resumed after being stopped.
    Continued,
}

/// Configuration for one forked subprocess.
#[derive(Debug, Clone, Default)]
pub struct SubprocessConfig {
    /// Process type, used to resolve the target executable path
    /// (`PNE_ID_CPU`/`PNE_ID_NPU`/`PNE_ID_UDF`/`queue_schedule`/
    /// `deployer_daemon` in the original taxonomy; represented here as
    /// an opaque string so callers can name local test binaries too).
    pub process_type: String,
    /// Path to the executable. Resolved by the caller (e.g. from
    /// `DeployConfig` + `process_type`) rather than by this type.
    pub executable: String,
    /// Positional CLI arguments, in order.
    pub args: Vec<String>,
    /// `--key=value` arguments, rendered in iteration order after
    /// positional args.
    pub kv_args: Vec<(String, String)>,
    /// Environment variables to set in the child, in addition to the
    /// inherited parent environment.
    pub envs: HashMap<String, String>,
    /// Environment variable names to remove from the child's
    /// environment even if present in the parent's.
    pub unset_envs: HashSet<String>,
    /// Signal delivered to the child if the parent dies
    /// (`PR_SET_PDEATHSIG`). Defaults to `SIGTERM`.
    pub death_signal: i32,
}

impl SubprocessConfig {
    /// Render positional args followed by `--key=value` pairs, matching
    /// the subprocess CLI contract.
    #[must_use]
    pub fn format_args(&self) -> Vec<String> {
        let mut out = self.args.clone();
        out.extend(self.kv_args.iter().map(|(k, v)| format!("--{k}={v}")));
        out
    }
}

type ExceptionCallback = Box<dyn Fn(i32, ProcStatus) + Send + Sync>;

struct Registered {
    callback: ExceptionCallback,
}

struct CommitTask {
    config: SubprocessConfig,
    reply: mpsc::Sender<Result<i32>>,
}

/// Forks and supervises child processes.
pub struct SubprocessManager {
    registered: Arc<Mutex<HashMap<i32, Registered>>>,
    planned_shutdown: Arc<Mutex<HashSet<i32>>>,
    running: Arc<AtomicBool>,
    commit_tx: Mutex<Option<mpsc::Sender<CommitTask>>>,
    commit_thread: Mutex<Option<JoinHandle<()>>>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SubprocessManager {
    /// Initialize the manager: start the single-worker fork/exec commit
    /// queue and the background monitor loop.
    pub fn initialize() -> Result<Self> {
        let registered: Arc<Mutex<HashMap<i32, Registered>>> = Arc::new(Mutex::new(HashMap::new()));
        let planned_shutdown: Arc<Mutex<HashSet<i32>>> = Arc::new(Mutex::new(HashSet::new()));
        let running = Arc::new(AtomicBool::new(true));

        let (commit_tx, commit_rx) = mpsc::channel::<CommitTask>();
        let commit_thread = std::thread::Builder::new()
            .name(format!("{}_fork", crate::constants::THREAD_NAME_PREFIX))
            .spawn(move || {
                for task in commit_rx {
                    let result = Self::fork_exec(&task.config);
                    let _ = task.reply.send(result);
                }
            })
            .map_err(|e| Error::Subprocess(format!("spawning the fork commit thread failed: {e}")))?;

        let monitor_registered = registered.clone();
        let monitor_planned_shutdown = planned_shutdown.clone();
        let monitor_running = running.clone();
        let monitor_thread = std::thread::Builder::new()
            .name(format!("{}_watch", crate::constants::THREAD_NAME_PREFIX))
            .spawn(move || {
                Self::monitor_loop(monitor_registered, monitor_planned_shutdown, monitor_running);
            })
            .map_err(|e| Error::Subprocess(format!("spawning the monitor thread failed: {e}")))?;

        Ok(Self {
            registered,
            planned_shutdown,
            running,
            commit_tx: Mutex::new(Some(commit_tx)),
            commit_thread: Mutex::new(Some(commit_thread)),
            monitor_thread: Mutex::new(Some(monitor_thread)),
        })
    }

    /// Fork and exec the target binary described by `config`, serialized
    /// through the single-worker commit queue. Returns the child pid.
    pub fn fork_subprocess(&self, config: SubprocessConfig) -> Result<i32> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let sender = self
            .commit_tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Subprocess("commit queue closed".into()))?;
        sender
            .send(CommitTask {
                config,
                reply: reply_tx,
            })
            .map_err(|_| Error::Subprocess("commit queue closed".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Subprocess("commit queue worker died".into()))?
    }

    /// Register a callback invoked on the commit-queue-forked pid's
    /// next `EXITED`/`SIGNALED` observation.
    pub fn register_exception_handle_callback(
        &self,
        pid: i32,
        callback: impl Fn(i32, ProcStatus) + Send + Sync + 'static,
    ) {
        self.registered.lock().insert(
            pid,
            Registered {
                callback: Box::new(callback),
            },
        );
    }

    /// Send SIGTERM, then poll for up to `grace_seconds * 10` times at
    /// 100ms; on timeout send SIGKILL. Marks the pid as a planned
    /// shutdown so the monitor loop does not escalate the resulting
    /// SIGNALED observation to an abnormal-status trigger.
    pub fn shutdown_subprocess(&self, pid: i32, grace_seconds: u32) -> Result<()> {
        self.planned_shutdown.lock().insert(pid);
        self.registered.lock().insert(
            pid,
            Registered {
                callback: Box::new(|_, _| {}),
            },
        );

        // SAFETY: pid is a value previously returned by fork_subprocess;
        // SIGTERM is a well-defined signal number.
        let term = unsafe { libc::kill(pid, libc::SIGTERM) };
        if term != 0 {
            return Err(Error::Subprocess(format!("kill(SIGTERM) failed for pid {pid}")));
        }

        let polls = grace_seconds.saturating_mul(crate::constants::SHUTDOWN_POLLS_PER_SECOND);
        for _ in 0..polls {
            std::thread::sleep(crate::constants::SHUTDOWN_POLL_INTERVAL);
            if !Self::pid_alive(pid) {
                return Ok(());
            }
        }

        // SAFETY: same pid as above.
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        warn!(pid, "subprocess did not exit within grace period, sent SIGKILL");
        Ok(())
    }

    /// Stop the monitor thread, close the commit queue, join both
    /// background threads, and clear all bookkeeping (registered
    /// callbacks, planned-shutdown markers).
    pub fn finalize(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor_thread.lock().take() {
            let _ = handle.join();
        }
        // Dropping the sender side lets the commit thread's
        // `for task in commit_rx` loop end so it can be joined.
        self.commit_tx.lock().take();
        if let Some(handle) = self.commit_thread.lock().take() {
            let _ = handle.join();
        }
        self.registered.lock().clear();
        self.planned_shutdown.lock().clear();
    }

    fn fork_exec(config: &SubprocessConfig) -> Result<i32> {
        let mut command = Command::new(&config.executable);
        command.args(config.format_args());
        for (key, value) in &config.envs {
            command.env(key, value);
        }
        for key in &config.unset_envs {
            command.env_remove(key);
        }

        let death_signal = if config.death_signal == 0 {
            libc::SIGTERM
        } else {
            config.death_signal
        };

        // SAFETY: pre_exec runs in the forked child after fork() but
        // before exec(); prctl(PR_SET_PDEATHSIG) is async-signal-safe
        // and takes no heap-allocating path.
        unsafe {
            command.pre_exec(move || {
                if libc::prctl(libc::PR_SET_PDEATHSIG, death_signal) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| Error::Subprocess(format!("fork/exec {} failed: {e}", config.executable)))?;
        let pid = child.id() as i32;
        // `Child::drop` does not wait() or kill the process, so dropping
        // it here is safe: liveness and reaping are owned by the
        // monitor loop's `waitpid` polling, not by a per-call handle.
        drop(child);
        Ok(pid)
    }

    fn pid_alive(pid: i32) -> bool {
        // SAFETY: signal 0 performs no action beyond existence/permission
        // checks.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn monitor_loop(
        registered: Arc<Mutex<HashMap<i32, Registered>>>,
        planned_shutdown: Arc<Mutex<HashSet<i32>>>,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::SeqCst) {
            let pids: Vec<i32> = registered.lock().keys().copied().collect();
            for pid in pids {
                let mut status: i32 = 0;
                // SAFETY: pid was returned by a prior successful fork_exec.
                let result = unsafe {
                    libc::waitpid(
                        pid,
                        &mut status,
                        libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
                    )
                };
                if result == 0 || result == -1 {
                    continue;
                }

                let proc_status = if libc::WIFEXITED(status) {
                    let code = libc::WEXITSTATUS(status);
                    if code == 0 {
                        ProcStatus::Normal
                    } else {
                        ProcStatus::Exited(code)
                    }
                } else if libc::WIFSIGNALED(status) {
                    ProcStatus::Signaled(libc::WTERMSIG(status))
                } else if libc::WIFSTOPPED(status) {
                    ProcStatus::Stopped
                } else if libc::WIFCONTINUED(status) {
                    ProcStatus::Continued
                } else {
                    continue;
                };

                let is_planned = planned_shutdown.lock().contains(&pid);
                match proc_status {
                    ProcStatus::Normal | ProcStatus::Exited(_) | ProcStatus::Signaled(_) => {
                        if is_planned {
                            debug!(pid, ?proc_status, "planned shutdown observed, suppressing escalation");
                        } else if matches!(proc_status, ProcStatus::Normal) {
                            info!(pid, ?proc_status, "subprocess exited");
                        } else {
                            error!(pid, ?proc_status, "subprocess terminated abnormally");
                        }
                        if let Some(entry) = registered.lock().remove(&pid) {
                            (entry.callback)(pid, proc_status);
                        }
                        planned_shutdown.lock().remove(&pid);
                    }
                    ProcStatus::Stopped | ProcStatus::Continued => {
                        info!(pid, ?proc_status, "subprocess state change");
                    }
                }
            }
            std::thread::sleep(SUBPROCESS_MONITOR_POLL_INTERVAL);
        }
    }
}

impl Drop for SubprocessManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor_thread.lock().take() {
            let _ = handle.join();
        }
        self.commit_tx.lock().take();
        if let Some(handle) = self.commit_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as TestFlag;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn format_args_renders_positional_then_kv() {
        let config = SubprocessConfig {
            args: vec!["group0".into(), "1".into(), "2".into(), "0".into()],
            kv_args: vec![("base_dir".into(), "/tmp/s".into())],
            ..Default::default()
        };
        assert_eq!(
            config.format_args(),
            vec!["group0", "1", "2", "0", "--base_dir=/tmp/s"]
        );
    }

    #[test]
    fn fork_exec_and_monitor_reports_exit() {
        let manager = SubprocessManager::initialize().unwrap();
        let config = SubprocessConfig {
            process_type: "test".into(),
            executable: "/bin/sh".into(),
            args: vec!["-c".into(), "exit 0".into()],
            ..Default::default()
        };
        let pid = manager.fork_subprocess(config).unwrap();

        let observed = Arc::new(StdMutex::new(None));
        let observed_clone = observed.clone();
        let done = Arc::new(TestFlag::new(false));
        let done_clone = done.clone();
        manager.register_exception_handle_callback(pid, move |_pid, status| {
            *observed_clone.lock().unwrap() = Some(status);
            done_clone.store(true, Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !done.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(done.load(Ordering::SeqCst), "monitor did not observe exit in time");
        manager.finalize();
    }

    #[test]
    fn planned_shutdown_swaps_in_noop_callback_and_clears_after_observation() {
        let manager = SubprocessManager::initialize().unwrap();
        let config = SubprocessConfig {
            process_type: "test".into(),
            executable: "/bin/sh".into(),
            args: vec!["-c".into(), "sleep 5".into()],
            ..Default::default()
        };
        let pid = manager.fork_subprocess(config).unwrap();

        let fired = Arc::new(TestFlag::new(false));
        let fired_clone = fired.clone();
        manager.register_exception_handle_callback(pid, move |_pid, _status| {
            fired_clone.store(true, Ordering::SeqCst);
        });

        // ShutdownSubprocess swaps in a no-op callback, discarding the
        // caller-registered one, per the planned-shutdown contract.
        manager.shutdown_subprocess(pid, 1).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.planned_shutdown.lock().contains(&pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(!manager.planned_shutdown.lock().contains(&pid));
        assert!(!fired.load(Ordering::SeqCst), "original callback must be suppressed");
        manager.finalize();
    }

    #[test]
    fn finalize_closes_commit_queue_and_joins_commit_thread() {
        let manager = SubprocessManager::initialize().unwrap();
        manager.finalize();

        let config = SubprocessConfig {
            process_type: "test".into(),
            executable: "/bin/true".into(),
            ..Default::default()
        };
        let err = manager.fork_subprocess(config).unwrap_err();
        assert!(matches!(err, Error::Subprocess(_)));
        assert!(manager.commit_thread.lock().is_none(), "commit thread must be joined by finalize");
    }
}

//! Crate-wide constants.
//!
//! Values here mirror the fixed timing and sizing constants named in the
//! deployment/exchange/executor-supervision design: subprocess monitor
//! poll interval, shutdown grace polling, bounded cache sizes, and the
//! well-known sentinel/env-var names the abnormal status handler and
//! subprocess manager rely on.

use std::time::Duration;

/// `SubprocessManager`'s background monitor polls every registered pid at
/// this interval.
pub const SUBPROCESS_MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Polling interval while waiting for `ShutdownSubprocess`'s grace period
/// to elapse before escalating to SIGKILL.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `ShutdownSubprocess` polls `grace_seconds * SHUTDOWN_POLLS_PER_SECOND`
/// times before giving up and sending SIGKILL.
pub const SHUTDOWN_POLLS_PER_SECOND: u32 = 10;

/// After an `inotify` IN_MODIFY event on the resource-config file, the
/// abnormal status handler waits this long for the `redeploy` sentinel
/// file to appear.
pub const REDEPLOY_SENTINEL_WAIT: Duration = Duration::from_millis(500);

/// Poll interval while waiting for the `redeploy` sentinel file.
pub const REDEPLOY_SENTINEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of polls for the `redeploy` sentinel file
/// (`REDEPLOY_SENTINEL_WAIT` / `REDEPLOY_SENTINEL_POLL_INTERVAL`).
pub const REDEPLOY_SENTINEL_POLLS: u32 = 10;

/// Bound on the dynamic-sched routing decision cache
/// (`trans_id -> route_labels`).
pub const DYNAMIC_SCHED_CACHE_BOUND: usize = 1024;

/// Bound on the data-flow exception cache (per model-IO scope).
pub const DATA_FLOW_EXCEPTION_CACHE_BOUND: usize = 1024;

/// Maximum size of the thread pool used to parse submodels in parallel
/// during `BatchLoadModel`.
pub const BATCH_LOAD_PARSE_POOL_MAX: usize = 8;

/// Default per-transfer-queue depth used for content-sharing flows.
pub const TRANSFER_QUEUE_DEPTH: usize = 128;

/// Environment variable naming an explicit resource-config file path.
pub const ENV_HELPER_RES_FILE_PATH: &str = "HELPER_RES_FILE_PATH";

/// Environment variable naming the install root used to derive the
/// default resource-config path (`<root>/conf/resource.json`).
pub const ENV_ASCEND_LATEST_INSTALL_PATH: &str = "ASCEND_LATEST_INSTALL_PATH";

/// Environment variable naming the NPU collection executable path.
pub const ENV_NPU_COLLECT_PATH_EXE: &str = "NPU_COLLECT_PATH_EXE";

/// Environment variable controlling the global log level propagated to
/// forked executors.
pub const ENV_ASCEND_GLOBAL_LOG_LEVEL: &str = "ASCEND_GLOBAL_LOG_LEVEL";

/// Environment variable toggling global event emission in forked
/// executors.
pub const ENV_ASCEND_GLOBAL_EVENT_ENABLE: &str = "ASCEND_GLOBAL_EVENT_ENABLE";

/// Environment variable bounding the host log file count.
pub const ENV_ASCEND_HOST_LOG_FILE_NUM: &str = "ASCEND_HOST_LOG_FILE_NUM";

/// Environment variables propagated by default into every forked
/// executor's environment unless the caller's `SubprocessConfig` unsets
/// them.
pub const DEFAULT_PROPAGATED_ENV_VARS: &[&str] = &[
    ENV_ASCEND_LATEST_INSTALL_PATH,
    ENV_NPU_COLLECT_PATH_EXE,
    ENV_ASCEND_GLOBAL_LOG_LEVEL,
    ENV_ASCEND_GLOBAL_EVENT_ENABLE,
    ENV_ASCEND_HOST_LOG_FILE_NUM,
];

/// Name of the resource-config file watched by the abnormal status
/// handler, relative to its containing directory.
pub const RESOURCE_CONFIG_FILE_NAME: &str = "resource.json";

/// Sentinel file name signaling that a redeploy is requested.
pub const SENTINEL_REDEPLOY: &str = "redeploy";

/// Sentinel file name signaling that a redeploy completed successfully.
pub const SENTINEL_REDEPLOY_DONE: &str = "redeploy.done";

/// Sentinel file name signaling that a redeploy could not be completed.
pub const SENTINEL_REDEPLOY_ERROR: &str = "redeploy.error";

/// Default background-thread name prefix, matching the corpus's
/// `ge_dpl_*` diagnostic naming convention.
pub const THREAD_NAME_PREFIX: &str = "ge_dpl";

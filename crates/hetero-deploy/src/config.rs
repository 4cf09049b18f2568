//! Deployment engine configuration.
//!
//! `DeployConfig` is loaded from a TOML file and then layered with
//! environment-variable overrides, following the corpus's
//! config-then-env-override pattern. It covers the session working
//! directory, resource-config sentinel files, timing knobs, and the
//! bounds used by the dynamic-sched and data-flow-exception caches.

use crate::constants::{
    BATCH_LOAD_PARSE_POOL_MAX, DATA_FLOW_EXCEPTION_CACHE_BOUND, DYNAMIC_SCHED_CACHE_BOUND,
    ENV_ASCEND_LATEST_INSTALL_PATH, ENV_HELPER_RES_FILE_PATH, RESOURCE_CONFIG_FILE_NAME,
    TRANSFER_QUEUE_DEPTH,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level deployment engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Root directory under which per-session working directories are
    /// created: `<deploy_res_dir>/<session_name>/`.
    pub deploy_res_dir: PathBuf,

    /// Explicit path to the resource-config file. When `None`, resolved
    /// at runtime from `HELPER_RES_FILE_PATH` or
    /// `<ASCEND_LATEST_INSTALL_PATH>/conf/resource.json`.
    pub resource_config_path: Option<PathBuf>,

    /// Heartbeat interval used by the per-`DeployContext` heartbeat
    /// thread to poll remote deployers for abnormal devices/pids.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Poll interval used by the subprocess monitor loop.
    #[serde(with = "duration_millis")]
    pub subprocess_monitor_interval: Duration,

    /// Upper bound on the thread pool used to parse submodels in
    /// parallel during `BatchLoadModel`.
    pub batch_load_parse_pool_max: usize,

    /// Bound on the dynamic-sched routing decision cache.
    pub dynamic_sched_cache_bound: usize,

    /// Bound on the fetch-alignment cache (per output port).
    pub fetch_alignment_cache_bound: usize,

    /// Bound on the data-flow exception cache (per scope).
    pub data_flow_exception_cache_bound: usize,

    /// Depth of the per-device transfer queue used for content-sharing
    /// flows.
    pub transfer_queue_depth: usize,

    /// Environment variable names propagated to every forked executor
    /// unless a specific `SubprocessConfig` unsets them.
    pub propagated_env_vars: Vec<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            deploy_res_dir: PathBuf::from("/var/run/hetero-deploy"),
            resource_config_path: None,
            heartbeat_interval: Duration::from_secs(1),
            subprocess_monitor_interval: crate::constants::SUBPROCESS_MONITOR_POLL_INTERVAL,
            batch_load_parse_pool_max: BATCH_LOAD_PARSE_POOL_MAX,
            dynamic_sched_cache_bound: DYNAMIC_SCHED_CACHE_BOUND,
            fetch_alignment_cache_bound: 2,
            data_flow_exception_cache_bound: DATA_FLOW_EXCEPTION_CACHE_BOUND,
            transfer_queue_depth: TRANSFER_QUEUE_DEPTH,
            propagated_env_vars: crate::constants::DEFAULT_PROPAGATED_ENV_VARS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl DeployConfig {
    /// Load configuration from a TOML file, then apply environment
    /// variable overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config: DeployConfig =
            toml::from_str(&text).map_err(|e| Error::ParamInvalid(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply the defaults layered with any present environment variable
    /// overrides, without reading a TOML file.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_HELPER_RES_FILE_PATH) {
            self.resource_config_path = Some(PathBuf::from(path));
        } else if let Ok(install_path) = std::env::var(ENV_ASCEND_LATEST_INSTALL_PATH) {
            self.resource_config_path =
                Some(PathBuf::from(install_path).join("conf").join(RESOURCE_CONFIG_FILE_NAME));
        }
    }

    /// Resolve the effective resource-config path, applying the same
    /// precedence as [`Self::apply_env_overrides`] for callers that
    /// constructed a `DeployConfig` directly rather than via
    /// [`Self::load`]/[`Self::from_env`].
    #[must_use]
    pub fn resolved_resource_config_path(&self) -> PathBuf {
        if let Some(path) = &self.resource_config_path {
            return path.clone();
        }
        self.deploy_res_dir.join(RESOURCE_CONFIG_FILE_NAME)
    }

    /// Working directory for a given session.
    #[must_use]
    pub fn session_dir(&self, session_name: &str) -> PathBuf {
        self.deploy_res_dir.join(session_name)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_resolves_session_dir() {
        let config = DeployConfig::default();
        assert_eq!(
            config.session_dir("session-a"),
            PathBuf::from("/var/run/hetero-deploy/session-a")
        );
    }

    #[test]
    fn default_propagated_env_vars_nonempty() {
        let config = DeployConfig::default();
        assert!(config.propagated_env_vars.contains(&"ASCEND_GLOBAL_LOG_LEVEL".to_string()));
    }

    #[test]
    fn load_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(
            &path,
            r#"
            deploy_res_dir = "/tmp/sessions"
            heartbeat_interval = 2000
            subprocess_monitor_interval = 200
            batch_load_parse_pool_max = 4
            dynamic_sched_cache_bound = 512
            fetch_alignment_cache_bound = 2
            data_flow_exception_cache_bound = 512
            transfer_queue_depth = 64
            propagated_env_vars = []
            "#,
        )
        .unwrap();
        let config = DeployConfig::load(&path).unwrap();
        assert_eq!(config.deploy_res_dir, PathBuf::from("/tmp/sessions"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
    }
}

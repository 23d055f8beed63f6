use crate::backend::BackendKind;
use crate::metrics::EnergyModel;
use crate::storage::{EvictionPolicy, TierPolicy};
use crate::telemetry::CStateMap;
use idlesnap_common::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Controller configuration
///
/// Loaded from an optional YAML file, then overridden by `IDLESNAP_*`
/// environment variables. Every field has a default so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub backend: BackendKind,

    /// Idle time after which an instance becomes a checkpoint candidate
    pub idle_threshold_ms: u64,
    /// Requests per second below which an idle instance may be checkpointed
    pub rate_threshold: f64,
    pub rate_window_ms: u64,
    pub sweep_interval_ms: u64,

    pub checkpoint_timeout_ms: u64,
    pub restore_timeout_ms: u64,
    pub restore_attempts: u32,
    pub restore_backoff_ms: u64,
    pub checkpoint_ttl_secs: u64,

    pub pool_capacity_bytes: u64,
    pub eviction_policy: EvictionPolicy,
    pub memory_footprint_limit_bytes: u64,
    pub memory_sla_bound_ms: u64,
    /// Directory for the compressed cold tier; no cold tier when unset
    pub cold_dir: Option<PathBuf>,

    pub max_queue_depth: usize,
    pub request_timeout_ms: u64,

    pub telemetry_interval_ms: u64,
    pub telemetry_capacity: usize,
    pub sysfs_root: PathBuf,
    /// Cores to sample; empty means every online core
    pub cores: Vec<u32>,
    pub cstate_map: CStateMap,
    /// Canonical name of the deep idle state energy estimates are based on
    pub deep_idle_state: String,

    pub energy: EnergyModel,
    pub docker: DockerSettings,
    pub criu: CriuSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    pub binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriuSettings {
    /// Explicit binary; looked up on `PATH` when unset
    pub binary: Option<PathBuf>,
    pub images_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub tcp_established: bool,
    pub shell_job: bool,
    pub ext_unix_sk: bool,
    pub file_locks: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            idle_threshold_ms: 30_000,
            rate_threshold: 1.0,
            rate_window_ms: 10_000,
            sweep_interval_ms: 250,
            checkpoint_timeout_ms: 30_000,
            restore_timeout_ms: 30_000,
            restore_attempts: 3,
            restore_backoff_ms: 200,
            checkpoint_ttl_secs: 24 * 60 * 60,
            pool_capacity_bytes: 4 * 1024 * 1024 * 1024,
            eviction_policy: EvictionPolicy::OldestGenerationFirst,
            memory_footprint_limit_bytes: 512 * 1024 * 1024,
            memory_sla_bound_ms: 2_000,
            cold_dir: None,
            max_queue_depth: 128,
            request_timeout_ms: 30_000,
            telemetry_interval_ms: 1_000,
            telemetry_capacity: 16_384,
            sysfs_root: PathBuf::from("/sys/devices/system/cpu"),
            cores: Vec::new(),
            cstate_map: CStateMap::default(),
            deep_idle_state: "C6".to_string(),
            energy: EnergyModel::default(),
            docker: DockerSettings::default(),
            criu: CriuSettings::default(),
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
        }
    }
}

impl Default for CriuSettings {
    fn default() -> Self {
        Self {
            binary: None,
            images_dir: PathBuf::from("/var/lib/idlesnap/criu/images"),
            log_dir: Some(PathBuf::from("/var/lib/idlesnap/criu/logs")),
            tcp_established: true,
            shell_job: true,
            ext_unix_sk: true,
            file_locks: true,
        }
    }
}

impl ControllerConfig {
    /// Defaults, then the YAML file if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    SnapshotError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| SnapshotError::Config(format!("Invalid YAML: {e}")))
    }

    /// Apply `IDLESNAP_*` overrides from the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("IDLESNAP_BACKEND") {
            self.backend = backend.parse()?;
        }
        override_parsed(&lookup, "IDLESNAP_IDLE_THRESHOLD_MS", &mut self.idle_threshold_ms)?;
        override_parsed(&lookup, "IDLESNAP_RATE_THRESHOLD", &mut self.rate_threshold)?;
        override_parsed(&lookup, "IDLESNAP_CHECKPOINT_TIMEOUT_MS", &mut self.checkpoint_timeout_ms)?;
        override_parsed(&lookup, "IDLESNAP_RESTORE_TIMEOUT_MS", &mut self.restore_timeout_ms)?;
        override_parsed(&lookup, "IDLESNAP_RESTORE_ATTEMPTS", &mut self.restore_attempts)?;
        override_parsed(&lookup, "IDLESNAP_POOL_CAPACITY_BYTES", &mut self.pool_capacity_bytes)?;
        override_parsed(&lookup, "IDLESNAP_MAX_QUEUE_DEPTH", &mut self.max_queue_depth)?;
        override_parsed(&lookup, "IDLESNAP_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms)?;
        override_parsed(&lookup, "IDLESNAP_TELEMETRY_INTERVAL_MS", &mut self.telemetry_interval_ms)?;
        override_parsed(&lookup, "IDLESNAP_SERVER_POWER_W", &mut self.energy.server_power_w)?;

        if let Some(dir) = lookup("IDLESNAP_COLD_DIR") {
            self.cold_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(root) = lookup("IDLESNAP_SYSFS_ROOT") {
            self.sysfs_root = PathBuf::from(root);
        }
        if let Some(images) = lookup("IDLESNAP_CRIU_IMAGES_DIR") {
            self.criu.images_dir = PathBuf::from(images);
        }
        if let Some(binary) = lookup("IDLESNAP_CRIU_BINARY") {
            self.criu.binary = (!binary.is_empty()).then(|| PathBuf::from(binary));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_threshold_ms == 0 {
            return Err(SnapshotError::Config("idle_threshold_ms must be positive".into()));
        }
        if self.rate_threshold.is_nan() || self.rate_threshold <= 0.0 {
            return Err(SnapshotError::Config("rate_threshold must be positive".into()));
        }
        if self.rate_window_ms == 0 || self.sweep_interval_ms == 0 || self.telemetry_interval_ms == 0 {
            return Err(SnapshotError::Config("intervals must be positive".into()));
        }
        if self.restore_attempts == 0 {
            return Err(SnapshotError::Config("restore_attempts must be at least 1".into()));
        }
        if self.max_queue_depth == 0 {
            return Err(SnapshotError::Config("max_queue_depth must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.energy.c6_power_reduction) {
            return Err(SnapshotError::Config(
                "energy.c6_power_reduction must be within [0, 1]".into(),
            ));
        }
        if !self.cstate_map.contains_canonical(&self.deep_idle_state) {
            return Err(SnapshotError::Config(format!(
                "deep_idle_state {} has no entry in cstate_map",
                self.deep_idle_state
            )));
        }
        Ok(())
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }

    pub fn restore_backoff(&self) -> Duration {
        Duration::from_millis(self.restore_backoff_ms)
    }

    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn tier_policy(&self) -> TierPolicy {
        TierPolicy {
            memory_footprint_limit: self.memory_footprint_limit_bytes,
            memory_sla_bound: Duration::from_millis(self.memory_sla_bound_ms),
        }
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| SnapshotError::Config(format!("{key}={raw} is not a valid value")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.energy.server_power_w, 100.0);
        assert_eq!(config.deep_idle_state, "C6");
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = ControllerConfig::from_yaml(
            r#"
backend: simulated
idle_threshold_ms: 500
rate_threshold: 10.0
eviction_policy: least_recently_used
"#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Simulated);
        assert_eq!(config.idle_threshold(), Duration::from_millis(500));
        assert_eq!(config.eviction_policy, EvictionPolicy::LeastRecentlyUsed);
        // Untouched fields keep their defaults
        assert_eq!(config.restore_attempts, 3);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("IDLESNAP_BACKEND", "criu"),
            ("IDLESNAP_CHECKPOINT_TIMEOUT_MS", "2000"),
            ("IDLESNAP_COLD_DIR", "/tmp/cold"),
            ("IDLESNAP_CRIU_BINARY", "/opt/criu/sbin/criu"),
        ]
        .into_iter()
        .collect();

        let mut config = ControllerConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend, BackendKind::Criu);
        assert_eq!(config.checkpoint_timeout(), Duration::from_secs(2));
        assert_eq!(config.cold_dir, Some(PathBuf::from("/tmp/cold")));
        assert_eq!(config.criu.binary, Some(PathBuf::from("/opt/criu/sbin/criu")));
    }

    #[test]
    fn test_invalid_env_value_is_config_error() {
        let mut config = ControllerConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "IDLESNAP_RESTORE_ATTEMPTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Config(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let config = ControllerConfig {
            restore_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Configuration management for Routeguard.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, RouteguardError};

/// Prefix for environment overrides, e.g. `ROUTEGUARD__GUARD__COUNTER_SHARDS=128`.
const ENV_PREFIX: &str = "ROUTEGUARD";

/// Main configuration for Routeguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteguardConfig {
    /// Admission control and route scanning
    #[serde(default)]
    pub guard: GuardConfig,

    /// Persisted endpoint state
    #[serde(default)]
    pub storage: StorageConfig,

    /// System resource watch
    #[serde(default)]
    pub watch: SystemWatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Route manifest produced by the host application's route introspection
    #[serde(default = "default_routes_path")]
    pub routes_path: PathBuf,

    /// Re-scan the route manifest this often; 0 disables re-scanning
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,

    /// Number of shards in the counter map (power of two)
    #[serde(default = "default_counter_shards")]
    pub counter_shards: usize,

    /// Take the client IP from proxy forwarding headers when present
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            routes_path: default_routes_path(),
            rescan_interval_secs: default_rescan_interval(),
            counter_shards: default_counter_shards(),
            trust_forwarded_headers: false,
        }
    }
}

fn default_routes_path() -> PathBuf {
    PathBuf::from("routes.yaml")
}

fn default_rescan_interval() -> u64 {
    0
}

fn default_counter_shards() -> usize {
    64
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding endpoints, rules and version snapshots
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("routeguard-state.json")
}

/// Thresholds (percent) for the system resource watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemWatchConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cpu_threshold: f64,

    #[serde(default)]
    pub memory_threshold: f64,

    #[serde(default)]
    pub disk_threshold: f64,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
}

impl Default for SystemWatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cpu_threshold: 0.0,
            memory_threshold: 0.0,
            disk_threshold: 0.0,
            sample_interval_secs: default_sample_interval(),
        }
    }
}

fn default_sample_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RouteguardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RouteguardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RouteguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under
    /// `ROUTEGUARD__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RouteguardConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the rest of the system cannot run with.
    pub fn validate(&self) -> Result<()> {
        let shards = self.guard.counter_shards;
        if shards < 2 || !shards.is_power_of_two() {
            return Err(RouteguardError::Config(format!(
                "guard.counter_shards must be a power of two greater than 1, got {}",
                shards
            )));
        }

        let watch = &self.watch;
        if watch.enabled {
            if watch.cpu_threshold == 0.0 && watch.memory_threshold == 0.0 && watch.disk_threshold == 0.0 {
                return Err(RouteguardError::Config(
                    "to enable the system watch, set at least one threshold".to_string(),
                ));
            }
            if watch.sample_interval_secs == 0 {
                return Err(RouteguardError::Config(
                    "watch.sample_interval_secs must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RouteguardConfig::default();
        assert_eq!(config.guard.counter_shards, 64);
        assert_eq!(config.guard.rescan_interval_secs, 0);
        assert_eq!(config.storage.state_path, PathBuf::from("routeguard-state.json"));
        assert!(!config.watch.enabled);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
guard:
  routes_path: /etc/app/routes.yaml
  trust_forwarded_headers: true
watch:
  enabled: true
  cpu_threshold: 85.5
"#;
        let config = RouteguardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.guard.routes_path, PathBuf::from("/etc/app/routes.yaml"));
        assert!(config.guard.trust_forwarded_headers);
        assert_eq!(config.guard.counter_shards, 64);
        assert_eq!(config.watch.cpu_threshold, 85.5);
        assert_eq!(config.watch.sample_interval_secs, 60);
    }

    #[test]
    fn test_watch_without_thresholds_rejected() {
        let yaml = r#"
watch:
  enabled: true
"#;
        let result = RouteguardConfig::from_yaml(yaml);
        assert!(matches!(result, Err(RouteguardError::Config(_))));
    }

    #[test]
    fn test_shards_must_be_power_of_two() {
        let yaml = r#"
guard:
  counter_shards: 48
"#;
        let result = RouteguardConfig::from_yaml(yaml);
        assert!(matches!(result, Err(RouteguardError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "storage:\n  state_path: /var/lib/routeguard/state.json").unwrap();

        let config = RouteguardConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.storage.state_path, PathBuf::from("/var/lib/routeguard/state.json"));
        assert_eq!(config.guard.counter_shards, 64);
    }
}

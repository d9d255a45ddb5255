//! Configuration loading from YAML with environment overrides.

use super::types::Config;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;

        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Load `task-relay.yaml` from the working directory, or fall back to
    /// built-in defaults.
    pub fn load_or_default() -> Self {
        let default_path = Path::new("task-relay.yaml");
        if default_path.exists() {
            match Self::load(default_path) {
                Ok(config) => return config,
                Err(e) => {
                    warn!("Failed to load {:?}: {}; using defaults", default_path, e);
                }
            }
        }

        let mut config = Config::default();
        Self::apply_env_overrides(&mut config);
        config
    }

    /// Apply environment variable overrides to config.
    fn apply_env_overrides(config: &mut Config) {
        if let Ok(db_path) = std::env::var("TASK_RELAY_DB_PATH") {
            config.server.db_path = db_path.into();
        }

        if let Ok(port) = std::env::var("TASK_RELAY_PORT") {
            match port.parse() {
                Ok(port) => config.server.port = port,
                Err(_) => warn!("Ignoring non-numeric TASK_RELAY_PORT={}", port),
            }
        }

        if let Ok(workers) = std::env::var("TASK_RELAY_WORKERS") {
            match workers.parse() {
                Ok(workers) => config.server.workers = workers,
                Err(_) => warn!("Ignoring non-numeric TASK_RELAY_WORKERS={}", workers),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringMode;
    use tempfile::TempDir;

    #[test]
    fn load_parses_yaml_and_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
server:
  port: 9000
scoring:
  mode: ensemble
clients:
  acme:
    sla_hours: 24
    daily_capacity_hours: 4
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.scoring.mode, ScoringMode::Ensemble);
        assert_eq!(config.client("acme").sla_hours, 24.0);
        // Untouched sections keep their defaults
        assert_eq!(config.outbox.batch_size, 10);
        assert_eq!(config.scoring.weights.urgency, 0.30);
    }

    #[test]
    fn load_rejects_malformed_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "server: [not, a, map").unwrap();

        assert!(Config::load(&path).is_err());
    }
}

//! Application configuration.
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables (after `.env` has been read by the binary):
//!
//! | Variable           | Field                  |
//! |--------------------|------------------------|
//! | `API_BIND_ADDRESS` | `api.bind_address`     |
//! | `API_PORT`         | `api.port`             |
//! | `DATABASE_URL`     | `store.database_url`   |
//! | `LOG_DIR`          | `logging.dir`          |
//! | `RUST_LOG`         | `logging.filter`       |

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::api::ApiServerConfig;
use crate::controller::ControllerConfig;
use crate::feeder::{FeederConfig, SourceConfig};
use crate::pipeline::{ProcessorConfig, ScalingFormula, StageConfig};
use crate::store::StoreConfig;
use crate::{Error, Result};

/// Priority levels of each stage's input queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuesConfig {
    pub levels: Vec<usize>,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self { levels: vec![3, 1] }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// `EnvFilter` directive; the built-in default when unset.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filter: None,
        }
    }
}

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig {
            name: "probe".to_string(),
            processor: ProcessorConfig::TcpProbe {
                timeout_ms: 3000,
                forward_level: Some(0),
            },
            max_workers: None,
        },
        StageConfig {
            name: "locate".to_string(),
            processor: ProcessorConfig::LocationRecorder,
            max_workers: None,
        },
    ]
}

fn default_feeders() -> Vec<FeederConfig> {
    vec![
        FeederConfig {
            kind: "rescan".to_string(),
            regions: Vec::new(),
            pacing_ms: None,
            level: Some(1),
            autostart: false,
            source: SourceConfig::StoreRescan {
                max_age_hours: 12,
                interval_secs: 3600,
                max_retry: crate::store::DEFAULT_MAX_RETRY,
            },
        },
        FeederConfig {
            kind: "targets".to_string(),
            regions: Vec::new(),
            pacing_ms: None,
            level: Some(0),
            autostart: false,
            source: SourceConfig::TargetFile {
                path: "targets.txt".to_string(),
            },
        },
        FeederConfig {
            kind: "migrate".to_string(),
            regions: Vec::new(),
            pacing_ms: None,
            level: None,
            autostart: false,
            source: SourceConfig::StoreMigrate,
        },
    ]
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiServerConfig,
    pub controller: ControllerConfig,
    pub queues: QueuesConfig,
    pub stages: Vec<StageConfig>,
    pub scaling: ScalingFormula,
    pub feeders: Vec<FeederConfig>,
    pub store: StoreConfig,
    pub logging: LoggingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiServerConfig::default(),
            controller: ControllerConfig::default(),
            queues: QueuesConfig::default(),
            stages: default_stages(),
            scaling: ScalingFormula::default(),
            feeders: default_feeders(),
            store: StoreConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Read `path` (defaults when `None`), apply environment overrides and
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("invalid config {}: {e}", path.display())))
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.api.apply_env(&lookup);

        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.store.database_url = Some(url);
        }
        if let Some(dir) = lookup("LOG_DIR").filter(|v| !v.trim().is_empty()) {
            self.logging.dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup("RUST_LOG").filter(|v| !v.trim().is_empty()) {
            self.logging.filter = Some(filter);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::validation("at least one stage is required"));
        }
        if self.queues.levels.len() != self.stages.len() {
            return Err(Error::validation(format!(
                "{} stages need {} queue level entries, got {}",
                self.stages.len(),
                self.stages.len(),
                self.queues.levels.len()
            )));
        }
        if self.queues.levels.contains(&0) {
            return Err(Error::validation("a queue needs at least one level"));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(Error::validation("stage names must not be empty"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
        }

        self.scaling.validate()?;

        let mut kinds = HashSet::new();
        for feeder in &self.feeders {
            if !kinds.insert(feeder.kind.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate feeder kind: {}",
                    feeder.kind
                )));
            }
        }

        let c = &self.controller;
        if c.tick_interval_secs == 0 {
            return Err(Error::validation("tick_interval_secs must be positive"));
        }
        if c.heartbeat_ticks == 0 {
            return Err(Error::validation("heartbeat_ticks must be positive"));
        }
        // Idle workers must heartbeat before their budget runs out.
        if c.idle_heartbeat_secs == 0
            || c.idle_heartbeat_secs >= c.tick_interval_secs.saturating_mul(u64::from(c.heartbeat_ticks))
        {
            return Err(Error::validation(
                "idle_heartbeat_secs must be positive and shorter than tick_interval_secs * heartbeat_ticks",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queues.levels, vec![3, 1]);
        assert_eq!(config.controller.tick_interval_secs, 10);
        assert_eq!(config.api.port, 3000);
    }

    #[test]
    fn test_huge_tick_interval_does_not_overflow() {
        let mut config = AppConfig::default();
        config.controller.tick_interval_secs = u64::MAX;
        config.controller.heartbeat_ticks = u32::MAX;
        config.validate().unwrap();

        config.controller.idle_heartbeat_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "controller": {{ "tick_interval_secs": 2 }},
                "scaling": {{ "terms": [{{ "base_log": 10.0, "exp": 2.0 }}] }}
            }}"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.controller.tick_interval_secs, 2);
        assert_eq!(config.controller.heartbeat_ticks, 6);
        assert_eq!(config.scaling.terms.len(), 1);
        assert_eq!(config.scaling.offset, 0.509);
        assert_eq!(config.stages.len(), 2);
    }

    #[test]
    fn test_unknown_processor_is_rejected() {
        let json = r#"{ "stages": [{ "name": "x", "processor": { "type": "nope" } }], "queues": { "levels": [1] } }"#;
        assert!(serde_json::from_str::<AppConfig>(json).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("API_PORT", "8088"),
            ("API_BIND_ADDRESS", "127.0.0.1"),
            ("DATABASE_URL", "sqlite:test.db"),
            ("LOG_DIR", "/tmp/devscout-logs"),
            ("RUST_LOG", "devscout=debug"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.api.port, 8088);
        assert_eq!(config.api.bind_address, "127.0.0.1");
        assert_eq!(config.store.database_url.as_deref(), Some("sqlite:test.db"));
        assert_eq!(config.logging.dir, PathBuf::from("/tmp/devscout-logs"));
        assert_eq!(config.logging.filter.as_deref(), Some("devscout=debug"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.queues.levels = vec![3];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queues.levels = vec![3, 0];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stages.clear();
        config.queues.levels.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        let dup = config.feeders[0].clone();
        config.feeders.push(dup);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scaling.terms.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.controller.idle_heartbeat_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/devscout.json"))).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}

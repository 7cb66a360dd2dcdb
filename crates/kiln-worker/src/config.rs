use crate::errors::ConfigError;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REQUIRED_KEYS: &[&str] = &["WORKER_NAME", "MASTER_ADDRESS", "MAX_TASK_CAN_PROC"];

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(rename = "WORKER_NAME")]
    pub name: String,
    /// `host:port` of the master.
    #[serde(rename = "MASTER_ADDRESS")]
    pub master_address: String,
    #[serde(rename = "MAX_TASK_CAN_PROC")]
    pub max_tasks: usize,
    #[serde(rename = "WorkDir", default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Where to listen for providers once elected listener.
    #[serde(rename = "PostAddress", default = "default_post_address")]
    pub post_address: String,
    #[serde(rename = "StuckInterval", default = "default_stuck_interval")]
    pub stuck_interval: u64,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_post_address() -> String {
    "0.0.0.0:8066".to_string()
}

fn default_stuck_interval() -> u64 {
    600
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, master_address: impl Into<String>, max_tasks: usize) -> Self {
        Self {
            name: name.into(),
            master_address: master_address.into(),
            max_tasks,
            work_dir: default_work_dir(),
            post_address: default_post_address(),
            stuck_interval: default_stuck_interval(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let Value::Mapping(map) = &value else {
            return Err(ConfigError::Parse("top level must be a mapping".to_string()));
        };
        if let Some(missing) = REQUIRED_KEYS.iter().find(|key| !map.contains_key(**key)) {
            return Err(ConfigError::MissingKey(missing.to_string()));
        }
        serde_yaml::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn stuck_interval(&self) -> Duration {
        Duration::from_secs(self.stuck_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_required_keys_and_defaults() {
        let config = WorkerConfig::from_yaml(
            "WORKER_NAME: w1\nMASTER_ADDRESS: 10.0.0.2:8024\nMAX_TASK_CAN_PROC: 3\n",
        )
        .expect("config");
        assert_eq!(config.name, "w1");
        assert_eq!(config.max_tasks, 3);
        assert_eq!(config.work_dir, PathBuf::from("./work"));
        assert_eq!(config.post_address, "0.0.0.0:8066");
        assert_eq!(config.stuck_interval(), Duration::from_secs(600));
    }

    #[test]
    fn missing_capacity_is_reported() {
        let error = WorkerConfig::from_yaml("WORKER_NAME: w1\nMASTER_ADDRESS: m:1\n")
            .expect_err("missing key");
        assert_eq!(error, ConfigError::MissingKey("MAX_TASK_CAN_PROC".to_string()));
    }
}

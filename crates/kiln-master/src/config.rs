use crate::errors::{ConfigError, DispatchError};
use kiln_core::{Build, BuildSet, JobCommand};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REQUIRED_KEYS: &[&str] = &["Address", "Port", "LogDir", "ResultDir"];
pub const JOB_COMMAND_PREFIX: &str = "JOB_COMMAND_";
/// Task `extra` key naming a `JOB_COMMAND_<id>` entry.
pub const CMD_ID_KEY: &str = "cmd_id";

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "LogDir")]
    pub log_dir: PathBuf,
    #[serde(rename = "ResultDir")]
    pub result_dir: PathBuf,
    #[serde(rename = "WaitingInterval", default = "default_waiting_interval")]
    pub waiting_interval: u64,
    #[serde(rename = "StableThreshold", default = "default_stable_threshold")]
    pub stable_threshold: u64,
    #[serde(rename = "AgingThreshold", default = "default_aging_threshold")]
    pub aging_threshold: u64,
    #[serde(rename = "Storage", default)]
    pub storage: Option<PathBuf>,
    #[serde(skip)]
    pub catalog: JobCatalog,
}

fn default_waiting_interval() -> u64 {
    300
}

fn default_stable_threshold() -> u64 {
    10
}

fn default_aging_threshold() -> u64 {
    60
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let Value::Mapping(map) = value else {
            return Err(ConfigError::Parse("top level must be a mapping".to_string()));
        };

        for key in REQUIRED_KEYS {
            if !map.contains_key(*key) {
                return Err(ConfigError::MissingKey(key.to_string()));
            }
        }

        let catalog = JobCatalog::from_mapping(&map)?;
        let mut config: MasterConfig = serde_yaml::from_value(Value::Mapping(map))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.catalog = catalog;
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "Address".to_string(),
                reason: e.to_string(),
            })
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .clone()
            .unwrap_or_else(|| self.result_dir.join(".storage"))
    }

    pub fn waiting_interval(&self) -> Duration {
        Duration::from_secs(self.waiting_interval)
    }

    pub fn stable_threshold(&self) -> Duration {
        Duration::from_secs(self.stable_threshold)
    }

    pub fn aging_threshold(&self) -> Duration {
        Duration::from_secs(self.aging_threshold)
    }
}

/// Job commands a task can be bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCatalog {
    pub build: Option<Build>,
    pub build_set: Option<BuildSet>,
    pub commands: BTreeMap<String, JobCommand>,
}

impl JobCatalog {
    fn from_mapping(map: &Mapping) -> Result<Self, ConfigError> {
        let mut catalog = JobCatalog::default();

        for (key, value) in map {
            let Some(key) = key.as_str() else {
                continue;
            };
            match key {
                "Build" => catalog.build = Some(parse_entry(key, value)?),
                "BuildSet" => {
                    let set: BuildSet = parse_entry(key, value)?;
                    set.validate().map_err(|e| invalid(key, e))?;
                    catalog.build_set = Some(set);
                }
                _ => {
                    let Some(id) = key.strip_prefix(JOB_COMMAND_PREFIX) else {
                        continue;
                    };
                    let command: JobCommand = parse_entry(key, value)?;
                    command.validate().map_err(|e| invalid(key, e))?;
                    catalog.commands.insert(id.to_string(), command);
                }
            }
        }

        Ok(catalog)
    }

    /// Picks the command for a task: its `cmd_id` entry, else `BuildSet`, else `Build`.
    pub fn resolve(&self, cmd_id: Option<&str>) -> Result<JobCommand, DispatchError> {
        if let Some(id) = cmd_id {
            return self
                .commands
                .get(id)
                .cloned()
                .ok_or_else(|| DispatchError::CommandNotFound(format!("{JOB_COMMAND_PREFIX}{id}")));
        }
        if let Some(set) = &self.build_set {
            return Ok(JobCommand::Set(set.clone()));
        }
        self.build
            .clone()
            .map(JobCommand::Single)
            .ok_or_else(|| DispatchError::CommandNotFound("Build".to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.build.is_none() && self.build_set.is_none() && self.commands.is_empty()
    }
}

fn parse_entry<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T, ConfigError> {
    serde_yaml::from_value(value.clone()).map_err(|e| invalid(key, e))
}

fn invalid(key: &str, error: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: error.to_string(),
    }
}

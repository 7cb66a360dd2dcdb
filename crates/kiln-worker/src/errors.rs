use kiln_link::LinkError;
use kiln_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("config is not valid yaml: {0}")]
    Parse(String),
    #[error("missing required config key: {0}")]
    MissingKey(String),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{cmd}`: {reason}")]
    Spawn { cmd: String, reason: String },
    #[error("lost track of `{cmd}`: {reason}")]
    Wait { cmd: String, reason: String },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("failed to bind post listener: {0}")]
    Bind(String),
    #[error("no post listener to deliver to")]
    NoListener,
    #[error("I/O error: {0}")]
    Io(String),
}

use kiln_core::TaskError;
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
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind listener: {0}")]
    Bind(String),
    #[error("listener error: {0}")]
    Listener(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("worker {0} is already online")]
    Duplicate(String),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no job command configured for {0}")]
    CommandNotFound(String),
    #[error("task {0} is not tracked")]
    NotFound(String),
    #[error("worker {0} is not online")]
    Offline(String),
    #[error("worker {0} has no spare capacity")]
    Busy(String),
    #[error("send to {ident} failed: {reason}")]
    Send { ident: String, reason: String },
    #[error(transparent)]
    Task(#[from] TaskError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElectError {
    #[error("no candidates to elect from")]
    NoCandidates,
    #[error("no candidate accepted the listener role")]
    NoListener,
    #[error("timed out waiting for {0} to acknowledge")]
    AckTimeout(String),
    #[error("{ident} refused configuration: {reason}")]
    Rejected { ident: String, reason: String },
    #[error("could not reach {ident}: {reason}")]
    Send { ident: String, reason: String },
    #[error("acknowledgement channel closed")]
    ChannelClosed,
}

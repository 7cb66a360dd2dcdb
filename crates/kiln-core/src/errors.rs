use crate::model::TaskState;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },
    #[error("task {0} still has unfinished children")]
    ChildrenPending(String),
    #[error("task {0} has no failed child")]
    NoFailedChild(String),
    #[error("task {0} is not bound to a build")]
    NotBound(String),
    #[error("invalid task id: {0}")]
    Format(String),
    #[error("duplicate task id: {0}")]
    Duplicate(String),
    #[error("task {0} has no worker-side form")]
    NotDispatchable(String),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("build set declares no builds")]
    EmptyBuildSet,
    #[error("build {0} has no commands")]
    EmptyCommands(String),
    #[error("post group {post} references unknown build {build}")]
    MissingMember { post: String, build: String },
    #[error("build {build} is a member of both {first} and {second}")]
    DuplicateMembership {
        build: String,
        first: String,
        second: String,
    },
    #[error("invalid build id: {0}")]
    InvalidId(String),
}

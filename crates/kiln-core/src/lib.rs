pub mod errors;
pub mod group;
pub mod model;

pub use errors::{BuildError, TaskError};
pub use group::{TaskGroup, Tracked};
pub use model::{
    Build, BuildSet, DATETIME_KEY, JobCommand, MAX_TASK_ID_LEN, Menu, Placeholders, PostGroup,
    PostTask, SingleTask, SuperTask, Task, TaskKind, TaskState, TaskType, validate_task_id,
};

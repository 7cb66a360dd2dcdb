mod build;
mod state;
mod task;

pub use build::{Build, BuildSet, JobCommand, Placeholders, PostGroup};
pub use state::TaskState;
pub use task::{
    DATETIME_KEY, MAX_TASK_ID_LEN, Menu, PostTask, SingleTask, SuperTask, Task, TaskKind,
    TaskType, validate_task_id,
};

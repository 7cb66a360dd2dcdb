use kiln_protocol::ResponseState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Prepare,
    InProc,
    Finished,
    Failure,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Prepare,
        TaskState::InProc,
        TaskState::Finished,
        TaskState::Failure,
    ];

    pub fn successors(self) -> &'static [TaskState] {
        match self {
            Self::Prepare => &[Self::Prepare, Self::InProc, Self::Failure],
            Self::InProc => &[Self::InProc, Self::Prepare, Self::Finished, Self::Failure],
            Self::Finished => &[Self::Finished, Self::Failure],
            Self::Failure => &[Self::Failure],
        }
    }

    pub fn can_become(self, next: TaskState) -> bool {
        self.successors().contains(&next)
    }

    /// PREPARE and IN_PROC tasks are still owed a result.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Prepare | Self::InProc)
    }
}

impl From<ResponseState> for TaskState {
    fn from(state: ResponseState) -> Self {
        match state {
            ResponseState::Prepare => Self::Prepare,
            ResponseState::InProc => Self::InProc,
            ResponseState::Finished => Self::Finished,
            ResponseState::Failure => Self::Failure,
        }
    }
}

impl From<TaskState> for ResponseState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Prepare => Self::Prepare,
            TaskState::InProc => Self::InProc,
            TaskState::Finished => Self::Finished,
            TaskState::Failure => Self::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_terminal() {
        for next in TaskState::ALL {
            assert_eq!(TaskState::Failure.can_become(next), next == TaskState::Failure);
        }
    }

    #[test]
    fn finished_only_degrades_to_failure() {
        assert!(TaskState::Finished.can_become(TaskState::Failure));
        assert!(!TaskState::Finished.can_become(TaskState::Prepare));
        assert!(!TaskState::Finished.can_become(TaskState::InProc));
    }

    #[test]
    fn prepare_cannot_skip_to_finished() {
        assert!(!TaskState::Prepare.can_become(TaskState::Finished));
        assert!(TaskState::InProc.can_become(TaskState::Prepare));
    }
}

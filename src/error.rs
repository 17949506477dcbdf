use std::io;

use thiserror::Error;

use crate::models::task::TaskStatus;

pub type Result<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: u32,
        #[source]
        source: io::Error,
    },

    #[error("task {0} not found")]
    NotFound(u64),

    #[error("task {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: u64,
        status: TaskStatus,
        action: &'static str,
    },
}

impl TaskError {
    /// A short hint telling the user how to recover.
    pub fn suggestion(&self) -> &'static str {
        match self {
            TaskError::Launch { .. } => "check that the command exists and is executable",
            TaskError::Signal { .. } => "check the task status and try again",
            TaskError::NotFound(_) => "use `tasks` to list known task ids",
            TaskError::InvalidTransition { status, .. } if status.is_running() => "kill it first",
            TaskError::InvalidTransition { .. } => "use view instead of attach",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestions_name_the_corrective_action() {
        let running = TaskError::InvalidTransition {
            id: 1,
            status: TaskStatus::Running,
            action: "remove",
        };
        assert_eq!(running.suggestion(), "kill it first");
        assert_eq!(running.to_string(), "task 1 is RUNNING, cannot remove");

        let finished = TaskError::InvalidTransition {
            id: 2,
            status: TaskStatus::Completed,
            action: "attach",
        };
        assert_eq!(finished.suggestion(), "use view instead of attach");
        assert_eq!(TaskError::NotFound(9).to_string(), "task 9 not found");
    }
}

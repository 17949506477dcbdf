use std::fmt;
use std::time::Duration;

const DESCRIPTION_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn is_running(self) -> bool {
        self == TaskStatus::Running
    }

    /// Completed, failed and killed are absorbing.
    pub fn is_terminal(self) -> bool {
        !self.is_running()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Killed => "KILLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a task, safe to hand to display code.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: u64,
    pub command: String,
    pub description: String,
    pub status: TaskStatus,
    pub pid: u32,
    pub elapsed: Duration,
    pub exit_code: Option<i32>,
    pub line_count: usize,
    pub notified: bool,
}

/// Result of a kill or terminate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Signalled,
    AlreadyFinished,
}

/// Derives a short label from a command line.
pub fn describe_command(command: &str) -> String {
    let collapsed = command.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= DESCRIPTION_WIDTH {
        return collapsed;
    }
    let mut label: String = collapsed.chars().take(DESCRIPTION_WIDTH - 3).collect();
    label.push_str("...");
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_is_not_terminal() {
        assert!(!TaskStatus::Running.is_terminal());
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Killed] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[test]
    fn descriptions_are_collapsed_and_truncated() {
        assert_eq!(describe_command("  sleep   5 "), "sleep 5");

        let long = "find / -name '*.rs' -type f -newer Cargo.toml -print0 | xargs -0 wc -l";
        let label = describe_command(long);
        assert_eq!(label.chars().count(), DESCRIPTION_WIDTH);
        assert!(label.ends_with("..."));
        assert!(long.starts_with(label.trim_end_matches("...")));
    }
}

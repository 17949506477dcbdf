//! Read and control surface over the registry. Everything here goes through
//! [`TaskManager`]; rendering is plain text so the CLI decides how to print it.

use std::fmt::Write;
use std::time::Duration;

use log::debug;

use crate::error::Result;
use crate::manager::task_manager::TaskManager;
use crate::models::task::{KillOutcome, TaskInfo, TaskStatus};
use crate::worker::collector::Subscriber;

pub const VIEW_LINES: usize = 200;
pub const ATTACH_BACKLOG: usize = 12;
const COMMAND_WIDTH: usize = 40;

pub struct TaskBrowser<'a> {
    manager: &'a TaskManager,
}

impl<'a> TaskBrowser<'a> {
    pub fn new(manager: &'a TaskManager) -> Self {
        Self { manager }
    }

    /// Renders every task. Finished tasks shown here count as surfaced.
    pub fn table(&self) -> String {
        let tasks = self.manager.list(true);
        for task in tasks.iter().filter(|task| task.status.is_terminal()) {
            if let Err(e) = self.manager.consume_completion(task.id) {
                debug!("Task #{} vanished before it was surfaced: {}", task.id, e);
            }
        }
        render_table(&tasks)
    }

    pub fn view(&self, id: u64, last_n: Option<usize>) -> Result<String> {
        let task = self.manager.get(id)?;
        let lines = task.output(Some(last_n.unwrap_or(VIEW_LINES)));
        let mut text = format!("Task #{} - {} [{}]\n", id, task.description(), task.status());
        if lines.is_empty() {
            text.push_str("No output yet.\n");
        }
        for line in lines {
            text.push_str(&line);
            text.push('\n');
        }
        Ok(text)
    }

    pub fn attach(&self, id: u64, subscriber: Subscriber) -> Result<Vec<String>> {
        self.manager.attach(id, subscriber, ATTACH_BACKLOG)
    }

    pub fn kill(&self, id: u64) -> Result<String> {
        Ok(match self.manager.kill(id)? {
            KillOutcome::Signalled => format!("Task #{id} killed."),
            KillOutcome::AlreadyFinished => format!("Task #{id} already finished."),
        })
    }

    pub fn terminate(&self, id: u64) -> Result<String> {
        Ok(match self.manager.terminate(id)? {
            KillOutcome::Signalled => format!("Sent SIGTERM to task #{id}."),
            KillOutcome::AlreadyFinished => format!("Task #{id} already finished."),
        })
    }

    pub fn remove(&self, id: u64) -> Result<String> {
        self.manager.remove(id)?;
        Ok(format!("Task #{id} removed."))
    }
}

pub fn render_table(tasks: &[TaskInfo]) -> String {
    if tasks.is_empty() {
        return "No background tasks.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<4} {:<10} {:>8} {:>7} {:>7}  {:<24} {}",
        "ID", "STATUS", "ELAPSED", "LINES", "PID", "DESCRIPTION", "COMMAND"
    );
    let _ = writeln!(out, "{}", "-".repeat(100));
    for task in tasks {
        let status = match (task.status, task.exit_code) {
            (TaskStatus::Failed, Some(code)) => format!("FAILED({code})"),
            (status, _) => status.to_string(),
        };
        let command: String = task.command.chars().take(COMMAND_WIDTH).collect();
        let _ = writeln!(
            out,
            "{:<4} {:<10} {:>8} {:>7} {:>7}  {:<24} {}",
            task.id,
            status,
            format_elapsed(task.elapsed),
            task.line_count,
            task.pid,
            task.description,
            command
        );
    }
    out
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        return format!("{secs}s");
    }
    let (mins, secs) = (secs / 60, secs % 60);
    if mins < 60 {
        return format!("{mins}m {secs}s");
    }
    format!("{}h {}m", mins / 60, mins % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_human_friendly() {
        assert_eq!(format_elapsed(Duration::from_millis(900)), "0s");
        assert_eq!(format_elapsed(Duration::from_secs(59)), "59s");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "1m 1s");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 125)), "3h 2m");
    }

    #[test]
    fn table_lists_each_task_once() {
        let info = |id, status| TaskInfo {
            id,
            command: "ping -c 100 localhost".to_string(),
            description: "ping".to_string(),
            status,
            pid: 4242,
            elapsed: Duration::from_secs(5),
            exit_code: if status == TaskStatus::Failed { Some(2) } else { None },
            line_count: 7,
            notified: false,
        };
        let table = render_table(&[info(1, TaskStatus::Running), info(2, TaskStatus::Failed)]);
        let rows: Vec<&str> = table.lines().skip(2).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("1 ") && rows[0].contains("RUNNING"));
        assert!(rows[1].starts_with("2 ") && rows[1].contains("FAILED(2)"));
        assert_eq!(render_table(&[]), "No background tasks.\n");
    }

    #[cfg(unix)]
    #[test]
    fn actions_report_outcomes() {
        use crate::config::TaskConfig;
        use crate::error::TaskError;

        let manager = TaskManager::new(TaskConfig::default());
        let browser = TaskBrowser::new(&manager);
        let id = manager.create("echo one; echo two; sleep 5", "two lines").expect("create");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.output(id, None).expect("output").len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }

        assert!(matches!(browser.remove(id), Err(TaskError::InvalidTransition { .. })));
        assert_eq!(browser.kill(id).expect("kill"), format!("Task #{id} killed."));
        assert!(manager.get(id).expect("get").wait_timeout(Duration::from_secs(5)));
        assert_eq!(browser.kill(id).expect("kill"), format!("Task #{id} already finished."));
        assert_eq!(browser.terminate(id).expect("term"), format!("Task #{id} already finished."));

        let view = browser.view(id, None).expect("view");
        assert!(view.starts_with(&format!("Task #{id} - two lines [KILLED]")));
        assert!(view.ends_with("one\ntwo\n"));

        assert_eq!(manager.unnotified_completions().len(), 1);
        assert!(browser.table().contains("KILLED"));
        assert!(manager.unnotified_completions().is_empty());

        assert_eq!(browser.remove(id).expect("remove"), format!("Task #{id} removed."));
        assert!(matches!(browser.view(id, None), Err(TaskError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn table_tolerates_tasks_removed_while_rendering() {
        use crate::config::TaskConfig;

        let manager = TaskManager::new(TaskConfig::default());
        let ids: Vec<u64> = (0..20).map(|i| manager.create("true", &format!("t{i}")).expect("create")).collect();
        for id in &ids {
            assert!(manager.get(*id).expect("get").wait_timeout(Duration::from_secs(5)));
        }

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for id in &ids {
                    manager.remove(*id).expect("remove");
                }
            });
            let browser = TaskBrowser::new(&manager);
            for _ in 0..20 {
                browser.table();
            }
        });

        assert!(manager.unnotified_completions().is_empty());
        assert_eq!(TaskBrowser::new(&manager).table(), "No background tasks.\n");
    }
}

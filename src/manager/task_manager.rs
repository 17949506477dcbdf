use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::TaskConfig;
use crate::error::{Result, TaskError};
use crate::manager::execution::Execution;
use crate::manager::task::Task;
use crate::models::task::{KillOutcome, TaskInfo};
use crate::worker::collector::Subscriber;

/// Registry of background tasks.
///
/// The map lock only guards structural operations; each task synchronizes its
/// own output and state, so listing never waits on a streaming task.
pub struct TaskManager {
    tasks: Mutex<BTreeMap<u64, Arc<Task>>>,
    next_id: Mutex<u64>,
    config: TaskConfig,
}

impl TaskManager {
    pub fn new(config: TaskConfig) -> Self {
        TaskManager {
            tasks: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(0),
            config,
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Starts `command` in the background and returns its id without waiting.
    pub fn create(&self, command: &str, description: &str) -> Result<u64> {
        self.create_with_subscriber(command, description, None)
    }

    pub fn create_with_subscriber(
        &self,
        command: &str,
        description: &str,
        subscriber: Option<Subscriber>,
    ) -> Result<u64> {
        let execution = Execution::start(command, &self.config, subscriber)?;
        let id = self.register(description, execution);
        info!("Task '{}' created: {}", id, command);
        Ok(id)
    }

    /// Takes over an execution that is already running in the foreground.
    /// Its live subscriber is cleared; the lines it has already collected stay
    /// in its buffer, and collection continues into the same buffer.
    pub fn adopt(&self, execution: Arc<Execution>, description: &str) -> u64 {
        let handoff = execution.retarget(None);
        let id = self.register(description, execution);
        info!("Task '{}' adopted after {} lines of output.", id, handoff.lines);
        id
    }

    fn register(&self, description: &str, execution: Arc<Execution>) -> u64 {
        let id = {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            *next_id
        };
        let task = Arc::new(Task::new(id, description.to_string(), execution));
        self.tasks.lock().insert(id, task);
        id
    }

    pub fn get(&self, id: u64) -> Result<Arc<Task>> {
        self.tasks.lock().get(&id).cloned().ok_or(TaskError::NotFound(id))
    }

    fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Tasks ordered by id.
    pub fn list(&self, include_finished: bool) -> Vec<TaskInfo> {
        self.snapshot()
            .iter()
            .filter(|task| include_finished || task.is_running())
            .map(|task| task.info())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.snapshot().iter().filter(|task| task.is_running()).count()
    }

    /// Finished tasks whose completion has not been shown to the user yet.
    pub fn unnotified_completions(&self) -> Vec<TaskInfo> {
        self.snapshot()
            .iter()
            .filter(|task| !task.is_running() && !task.is_notified())
            .map(|task| task.info())
            .collect()
    }

    /// Marks a finished task's completion as surfaced. Returns true the first
    /// time only.
    pub fn consume_completion(&self, id: u64) -> Result<bool> {
        let task = self.get(id)?;
        if task.is_running() {
            return Ok(false);
        }
        Ok(task.mark_notified())
    }

    /// Returns every unsurfaced completion and marks it surfaced.
    pub fn take_completions(&self) -> Vec<TaskInfo> {
        self.snapshot()
            .iter()
            .filter(|task| !task.is_running() && task.mark_notified())
            .map(|task| task.info())
            .collect()
    }

    pub fn output(&self, id: u64, last_n: Option<usize>) -> Result<Vec<String>> {
        Ok(self.get(id)?.output(last_n))
    }

    pub fn kill(&self, id: u64) -> Result<KillOutcome> {
        self.get(id)?.kill(true)
    }

    pub fn terminate(&self, id: u64) -> Result<KillOutcome> {
        self.get(id)?.kill(false)
    }

    pub fn attach(&self, id: u64, subscriber: Subscriber, backlog: usize) -> Result<Vec<String>> {
        self.get(id)?.attach(subscriber, backlog)
    }

    pub fn detach(&self, id: u64) -> Result<()> {
        self.get(id)?.detach();
        Ok(())
    }

    /// Drops a finished task. Running tasks must be killed first.
    pub fn remove(&self, id: u64) -> Result<TaskInfo> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get(&id).ok_or(TaskError::NotFound(id))?;
        let status = task.status();
        if status.is_running() {
            return Err(TaskError::InvalidTransition {
                id,
                status,
                action: "remove",
            });
        }
        let info = task.info();
        tasks.remove(&id);
        info!("Task '{}' removed.", id);
        Ok(info)
    }

    /// Force-kills every running task and waits, within the kill grace
    /// period, for each to reach a terminal state. Returns how many were
    /// killed.
    pub fn cleanup_all(&self) -> usize {
        let killed = self.kill_running();
        let deadline = Instant::now() + self.config.kill_grace;
        for task in &killed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !task.wait_timeout(remaining) {
                warn!("Task '{}' still running after cleanup.", task.id());
            }
        }
        killed.len()
    }

    fn kill_running(&self) -> Vec<Arc<Task>> {
        let mut killed = Vec::new();
        for task in self.snapshot() {
            if !task.is_running() {
                continue;
            }
            match task.kill(true) {
                Ok(KillOutcome::Signalled) => {
                    info!("Killed task '{}' during cleanup.", task.id());
                    killed.push(task);
                }
                Ok(KillOutcome::AlreadyFinished) => {}
                Err(e) => warn!("Failed to kill task '{}' during cleanup: {}", task.id(), e),
            }
        }
        killed
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.kill_running();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::task::TaskStatus;
    use std::time::Duration;

    fn manager() -> TaskManager {
        TaskManager::new(TaskConfig {
            kill_grace: Duration::from_millis(500),
            ..TaskConfig::default()
        })
    }

    #[test]
    fn ids_strictly_increase() {
        let manager = manager();
        let ids: Vec<u64> = (0..4).map(|_| manager.create("true", "noop").expect("create")).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "{ids:?}");
    }

    #[test]
    fn launch_failure_does_not_consume_an_id() {
        let manager = TaskManager::new(TaskConfig {
            working_dir: Some("/nonexistent/task-shell-dir".into()),
            ..TaskConfig::default()
        });
        assert!(matches!(manager.create("true", "noop"), Err(TaskError::Launch { .. })));
        assert!(manager.list(true).is_empty());
        assert_eq!(*manager.next_id.lock(), 0);
    }

    #[test]
    fn remove_requires_a_terminal_task() {
        let manager = manager();
        let id = manager.create("sleep 5", "sleep").expect("create");

        let err = manager.remove(id).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { action: "remove", .. }));
        assert_eq!(err.suggestion(), "kill it first");

        assert_eq!(manager.kill(id).expect("kill"), KillOutcome::Signalled);
        assert!(manager.get(id).expect("get").wait_timeout(Duration::from_secs(5)));
        assert_eq!(manager.remove(id).expect("remove").status, TaskStatus::Killed);
        assert!(matches!(manager.get(id), Err(TaskError::NotFound(missing)) if missing == id));
        assert!(matches!(manager.remove(id), Err(TaskError::NotFound(_))));
    }

    #[test]
    fn completions_are_surfaced_once() {
        let manager = manager();
        let id = manager.create("echo hi", "greet").expect("create");
        assert!(manager.get(id).expect("get").wait_timeout(Duration::from_secs(5)));

        assert_eq!(manager.unnotified_completions().len(), 1);
        assert_eq!(manager.consume_completion(id).expect("consume"), true);
        assert_eq!(manager.consume_completion(id).expect("consume"), false);
        assert!(manager.unnotified_completions().is_empty());
        assert!(manager.take_completions().is_empty());
    }

    #[test]
    fn running_tasks_are_not_completions() {
        let manager = manager();
        let id = manager.create("sleep 5", "sleep").expect("create");
        assert_eq!(manager.running_count(), 1);
        assert!(manager.unnotified_completions().is_empty());
        assert_eq!(manager.consume_completion(id).expect("consume"), false);
        assert_eq!(manager.list(false).len(), 1);
        assert_eq!(manager.cleanup_all(), 1);
        assert_eq!(manager.running_count(), 0);
        assert!(manager.list(false).is_empty());
    }

    #[test]
    fn attach_is_refused_on_finished_tasks() {
        let manager = manager();
        let id = manager.create("true", "noop").expect("create");
        assert!(manager.get(id).expect("get").wait_timeout(Duration::from_secs(5)));
        let err = manager.attach(id, Subscriber::new("viewer", |_| Ok(())), 10).unwrap_err();
        assert_eq!(err.suggestion(), "use view instead of attach");
        assert!(matches!(manager.kill(99), Err(TaskError::NotFound(99))));
    }
}

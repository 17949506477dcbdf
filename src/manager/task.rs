use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TaskError};
use crate::models::task::{KillOutcome, TaskInfo, TaskStatus};
use crate::manager::execution::Execution;
use crate::worker::collector::Subscriber;

/// A registry entry: an id and label on top of a shared [`Execution`].
#[derive(Debug)]
pub struct Task {
    id: u64,
    description: String,
    execution: Arc<Execution>,
    notified: AtomicBool,
}

impl Task {
    pub(crate) fn new(id: u64, description: String, execution: Arc<Execution>) -> Self {
        Self {
            id,
            description,
            execution,
            notified: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn command(&self) -> &str {
        self.execution.command()
    }

    pub fn pid(&self) -> u32 {
        self.execution.pid()
    }

    pub fn execution(&self) -> &Arc<Execution> {
        &self.execution
    }

    pub fn status(&self) -> TaskStatus {
        self.execution.status()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.execution.exit_code()
    }

    pub fn elapsed(&self) -> Duration {
        self.execution.elapsed()
    }

    pub fn output(&self, last_n: Option<usize>) -> Vec<String> {
        self.execution.output(last_n)
    }

    pub fn kill(&self, forced: bool) -> Result<KillOutcome> {
        self.execution.kill(forced)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.execution.wait_timeout(timeout)
    }

    /// Installs a live subscriber and returns up to `backlog` recent lines.
    pub fn attach(&self, subscriber: Subscriber, backlog: usize) -> Result<Vec<String>> {
        let status = self.status();
        if status.is_terminal() {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                status,
                action: "attach",
            });
        }
        Ok(self.execution.subscribe(subscriber, backlog))
    }

    /// Removes the live subscriber, if any. The task keeps running.
    pub fn detach(&self) -> Option<Subscriber> {
        self.execution.retarget(None).previous
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    /// Flips the notified flag; true only for the call that flipped it.
    pub fn mark_notified(&self) -> bool {
        !self.notified.swap(true, Ordering::SeqCst)
    }

    pub fn info(&self) -> TaskInfo {
        let lifecycle = self.execution.lifecycle_snapshot();
        TaskInfo {
            id: self.id,
            command: self.command().to_string(),
            description: self.description.clone(),
            status: lifecycle.status,
            pid: self.pid(),
            elapsed: lifecycle.elapsed,
            exit_code: lifecycle.exit_code,
            line_count: self.execution.retained_lines(),
            notified: self.is_notified(),
        }
    }
}

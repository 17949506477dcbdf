//! Synchronous runs with live output, and the interrupt-driven handoff of such
//! a run into the background registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{at, never, select, Receiver};
use log::{info, warn};

use crate::error::Result;
use crate::manager::execution::Execution;
use crate::manager::task_manager::TaskManager;
use crate::models::task::TaskStatus;
use crate::worker::collector::Subscriber;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForegroundOutcome {
    Finished {
        status: TaskStatus,
        exit_code: Option<i32>,
        output: Vec<String>,
    },
    /// Handed to the registry; `lines_at_handoff` lines had reached the display.
    Backgrounded { id: u64, lines_at_handoff: usize },
    Cancelled { output: Vec<String> },
    TimedOut { after: Duration, output: Vec<String> },
}

impl ForegroundOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ForegroundOutcome::Finished {
                status: TaskStatus::Completed,
                ..
            } | ForegroundOutcome::Backgrounded { .. }
        )
    }
}

enum Wake {
    Exited,
    Interrupted,
    InterruptsClosed,
    Deadline,
}

pub struct ForegroundRunner<'a> {
    manager: &'a TaskManager,
    timeout: Duration,
}

impl<'a> ForegroundRunner<'a> {
    pub fn new(manager: &'a TaskManager, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    /// Runs `command`, streaming each line to `display`, until it exits, the
    /// timeout expires, or a message arrives on `interrupts`.
    ///
    /// On interrupt the display is detached and `confirm` decides the fate of
    /// the process: `true` adopts it into the registry, `false` kills it.
    pub fn run<C>(
        &self,
        command: &str,
        description: &str,
        display: Subscriber,
        interrupts: &Receiver<()>,
        confirm: C,
    ) -> Result<ForegroundOutcome>
    where
        C: FnOnce() -> bool,
    {
        let execution = Execution::start(command, self.manager.config(), Some(display))?;
        let deadline = Instant::now() + self.timeout;
        let mut interrupts = interrupts.clone();

        loop {
            let wake = select! {
                recv(execution.done()) -> _ => Wake::Exited,
                recv(interrupts) -> msg => match msg {
                    Ok(()) => Wake::Interrupted,
                    Err(_) => Wake::InterruptsClosed,
                },
                recv(at(deadline)) -> _ => Wake::Deadline,
            };
            match wake {
                Wake::Exited => return Ok(finished(&execution)),
                Wake::Interrupted => return Ok(self.interrupted(execution, description, confirm)),
                Wake::Deadline => return Ok(self.timed_out(&execution)),
                // Nobody can interrupt any more; keep waiting for exit or timeout.
                Wake::InterruptsClosed => interrupts = never(),
            }
        }
    }

    fn interrupted<C>(&self, execution: Arc<Execution>, description: &str, confirm: C) -> ForegroundOutcome
    where
        C: FnOnce() -> bool,
    {
        let handoff = execution.retarget(None);
        if execution.wait_timeout(Duration::ZERO) {
            return finished(&execution);
        }

        if confirm() {
            let id = self.manager.adopt(execution, description);
            return ForegroundOutcome::Backgrounded {
                id,
                lines_at_handoff: handoff.lines,
            };
        }

        info!("Foreground run of process group {} cancelled by user.", execution.pid());
        stop(&execution, self.manager.config().kill_grace);
        ForegroundOutcome::Cancelled {
            output: execution.output(None),
        }
    }

    fn timed_out(&self, execution: &Arc<Execution>) -> ForegroundOutcome {
        warn!(
            "Foreground run of process group {} timed out after {:?}.",
            execution.pid(),
            self.timeout
        );
        execution.retarget(None);
        stop(execution, self.manager.config().kill_grace);
        ForegroundOutcome::TimedOut {
            after: self.timeout,
            output: execution.output(None),
        }
    }
}

fn finished(execution: &Execution) -> ForegroundOutcome {
    ForegroundOutcome::Finished {
        status: execution.status(),
        exit_code: execution.exit_code(),
        output: execution.output(None),
    }
}

fn stop(execution: &Arc<Execution>, grace: Duration) {
    if let Err(e) = execution.kill(true) {
        warn!("Failed to kill process group {}: {}", execution.pid(), e);
    }
    if !execution.wait_timeout(grace) {
        warn!("Process group {} did not exit after kill.", execution.pid());
    }
}

//! A running (or finished) command: process group, collected output and
//! lifecycle state. Shared by the foreground runner and registry entries, so
//! backgrounding a foreground run hands over this very object.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};
use parking_lot::Mutex;

use crate::config::TaskConfig;
use crate::error::{Result, TaskError};
use crate::models::task::{KillOutcome, TaskStatus};
use crate::worker::collector::{spawn_collector, Handoff, Output, Subscriber};
use crate::worker::launcher::{launch, ProcessGroup, Signal};

/// How long a failed signal waits to see whether the process simply exited.
const SIGNAL_RACE_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Lifecycle {
    status: TaskStatus,
    exit_code: Option<i32>,
    finished_at: Option<Instant>,
    // Set only once a kill signal was delivered while still running.
    kill_requested: bool,
}

/// Status, exit code and elapsed time read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct Execution {
    command: String,
    group: ProcessGroup,
    started_at: Instant,
    kill_grace: Duration,
    output: Arc<Output>,
    lifecycle: Mutex<Lifecycle>,
    // Dropped on the terminal transition; waiters observe the disconnect.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl Execution {
    /// Launches `command` and starts collecting its output. Returns as soon as
    /// the process is spawned.
    pub fn start(command: &str, config: &TaskConfig, subscriber: Option<Subscriber>) -> Result<Arc<Self>> {
        let handle = launch(command, &config.env, config.working_dir.as_deref())?;
        let (done_tx, done_rx) = bounded(0);
        let output = Arc::new(Output::new(config.max_output_lines, subscriber));

        let execution = Arc::new(Self {
            command: command.to_string(),
            group: handle.group,
            started_at: Instant::now(),
            kill_grace: config.kill_grace,
            output: Arc::clone(&output),
            lifecycle: Mutex::new(Lifecycle {
                status: TaskStatus::Running,
                exit_code: None,
                finished_at: None,
                kill_requested: false,
            }),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
        });

        let on_exit = {
            let execution = Arc::clone(&execution);
            move |status: io::Result<ExitStatus>| execution.finish(status)
        };
        let name = format!("collector-{}", handle.group.id());
        if let Err(source) = spawn_collector(name, handle.output, handle.child, output, on_exit) {
            let _ = handle.group.terminate(Signal::Forced);
            return Err(TaskError::Launch {
                command: command.to_string(),
                source,
            });
        }
        Ok(execution)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> u32 {
        self.group.id()
    }

    pub fn status(&self) -> TaskStatus {
        self.lifecycle.lock().status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lifecycle.lock().exit_code
    }

    /// Running time so far, or total running time once finished.
    pub fn elapsed(&self) -> Duration {
        let end = self.lifecycle.lock().finished_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started_at)
    }

    pub fn kill_requested(&self) -> bool {
        self.lifecycle.lock().kill_requested
    }

    pub fn lifecycle_snapshot(&self) -> LifecycleSnapshot {
        let lifecycle = self.lifecycle.lock();
        let end = lifecycle.finished_at.unwrap_or_else(Instant::now);
        LifecycleSnapshot {
            status: lifecycle.status,
            exit_code: lifecycle.exit_code,
            elapsed: end.duration_since(self.started_at),
        }
    }

    pub fn output(&self, last_n: Option<usize>) -> Vec<String> {
        self.output.snapshot(last_n)
    }

    pub fn retained_lines(&self) -> usize {
        self.output.retained_lines()
    }

    pub fn retarget(&self, subscriber: Option<Subscriber>) -> Handoff {
        self.output.replace_subscriber(subscriber)
    }

    pub fn subscribe(&self, subscriber: Subscriber, backlog: usize) -> Vec<String> {
        self.output.subscribe(subscriber, backlog).0
    }

    /// A receiver that disconnects once the execution reaches a terminal state.
    pub fn done(&self) -> &Receiver<()> {
        &self.done_rx
    }

    /// Waits up to `timeout` for a terminal state; true if reached.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.done_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Signals the whole process group. A graceful request escalates to a
    /// forced kill if the group is still running after the grace period.
    ///
    /// The signal is sent under the lifecycle lock that `finish` takes, so a
    /// reap recorded first makes this a no-op, and a task only ends `KILLED`
    /// when the signal went out before its reap was recorded.
    pub fn kill(self: &Arc<Self>, forced: bool) -> Result<KillOutcome> {
        let signal = if forced { Signal::Forced } else { Signal::Graceful };
        let sent = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.status.is_terminal() {
                return Ok(KillOutcome::AlreadyFinished);
            }
            let sent = self.group.terminate(signal);
            if sent.is_ok() {
                lifecycle.kill_requested = true;
            }
            sent
        };

        if let Err(source) = sent {
            if self.wait_timeout(SIGNAL_RACE_WINDOW) {
                return Ok(KillOutcome::AlreadyFinished);
            }
            return Err(TaskError::Signal {
                pgid: self.group.id(),
                source,
            });
        }
        info!("Sent {:?} signal to process group {}.", signal, self.group.id());

        if !forced {
            self.escalate_after_grace();
        }
        Ok(KillOutcome::Signalled)
    }

    fn escalate_after_grace(self: &Arc<Self>) {
        let execution = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("kill-grace-{}", self.group.id()))
            .spawn(move || {
                if execution.wait_timeout(execution.kill_grace) {
                    return;
                }
                warn!(
                    "Process group {} ignored termination for {:?}; killing it.",
                    execution.group.id(),
                    execution.kill_grace
                );
                if let Err(e) = execution.group.terminate(Signal::Forced) {
                    warn!("Failed to kill process group {}: {}", execution.group.id(), e);
                }
            });
        if let Err(e) = spawned {
            warn!("Could not start grace timer, killing group {} now: {}", self.group.id(), e);
            let _ = self.group.terminate(Signal::Forced);
        }
    }

    /// Terminal transition, driven by the collector right after the child was
    /// reaped. A kill delivered before this point always wins.
    fn finish(&self, status: io::Result<ExitStatus>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.status.is_terminal() {
            return;
        }

        let exit_code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!("Failed to wait for process group {}: {}", self.group.id(), e);
                None
            }
        };
        lifecycle.status = if lifecycle.kill_requested {
            TaskStatus::Killed
        } else if exit_code == Some(0) {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        lifecycle.exit_code = exit_code;
        lifecycle.finished_at = Some(Instant::now());
        info!(
            "Process group {} finished: {} (exit code {:?}).",
            self.group.id(),
            lifecycle.status,
            exit_code
        );
        drop(lifecycle);

        self.done_tx.lock().take();
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    status.code().or_else(|| status.signal().map(|signo| -signo))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config() -> TaskConfig {
        TaskConfig {
            kill_grace: Duration::from_millis(300),
            ..TaskConfig::default()
        }
    }

    #[test]
    fn exit_code_decides_completed_or_failed() {
        let ok = Execution::start("echo done", &config(), None).expect("start");
        assert!(ok.wait_timeout(Duration::from_secs(5)));
        assert_eq!(ok.status(), TaskStatus::Completed);
        assert_eq!(ok.exit_code(), Some(0));
        assert_eq!(ok.output(None), vec!["done"]);

        let bad = Execution::start("exit 3", &config(), None).expect("start");
        assert!(bad.wait_timeout(Duration::from_secs(5)));
        assert_eq!(bad.status(), TaskStatus::Failed);
        assert_eq!(bad.exit_code(), Some(3));
    }

    #[test]
    fn kill_request_wins_over_exit_code() {
        // Exits 0 on SIGTERM, but the kill was requested first.
        let execution = Execution::start("trap 'exit 0' TERM; while true; do sleep 0.05; done", &config(), None)
            .expect("start");
        thread::sleep(Duration::from_millis(200));
        assert_eq!(execution.kill(false).expect("terminate"), KillOutcome::Signalled);
        assert!(execution.wait_timeout(Duration::from_secs(5)));
        assert_eq!(execution.status(), TaskStatus::Killed);
    }

    #[test]
    fn kill_after_exit_reports_already_finished() {
        let execution = Execution::start("true", &config(), None).expect("start");
        assert!(execution.wait_timeout(Duration::from_secs(5)));
        assert_eq!(execution.kill(true).expect("kill"), KillOutcome::AlreadyFinished);
        assert_eq!(execution.kill(false).expect("terminate"), KillOutcome::AlreadyFinished);
        assert_eq!(execution.status(), TaskStatus::Completed);
        assert!(!execution.kill_requested());
    }

    #[test]
    fn kill_racing_a_natural_exit_stays_consistent() {
        for round in 0..200u64 {
            let execution = Execution::start("exit 0", &config(), None).expect("start");
            thread::sleep(Duration::from_micros(round % 8 * 150));
            let outcome = execution.kill(true).expect("kill");
            assert!(execution.wait_timeout(Duration::from_secs(5)));

            let snapshot = execution.lifecycle_snapshot();
            match outcome {
                KillOutcome::AlreadyFinished => {
                    assert_eq!(snapshot.status, TaskStatus::Completed, "round {round}");
                    assert_eq!(snapshot.exit_code, Some(0));
                    assert!(!execution.kill_requested());
                }
                KillOutcome::Signalled => {
                    assert_eq!(snapshot.status, TaskStatus::Killed, "round {round}");
                    assert!(execution.kill_requested());
                }
            }
        }
    }

    #[test]
    fn lifecycle_snapshot_agrees_with_accessors_once_finished() {
        let execution = Execution::start("exit 4", &config(), None).expect("start");
        assert!(execution.wait_timeout(Duration::from_secs(5)));
        let snapshot = execution.lifecycle_snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.exit_code, Some(4));
        assert_eq!(snapshot.elapsed, execution.elapsed());
    }

    #[test]
    fn graceful_kill_escalates_when_ignored() {
        let execution = Execution::start("trap '' TERM; while true; do sleep 0.05; done", &config(), None)
            .expect("start");
        thread::sleep(Duration::from_millis(200));
        execution.kill(false).expect("terminate");
        assert!(!execution.wait_timeout(Duration::from_millis(100)));
        assert!(execution.wait_timeout(Duration::from_secs(5)));
        assert_eq!(execution.status(), TaskStatus::Killed);
        assert_eq!(execution.exit_code(), Some(-libc::SIGKILL));
    }

    #[test]
    fn elapsed_freezes_once_finished() {
        let execution = Execution::start("true", &config(), None).expect("start");
        assert!(execution.wait_timeout(Duration::from_secs(5)));
        let first = execution.elapsed();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(execution.elapsed(), first);
    }
}

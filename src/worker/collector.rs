//! Per-task output draining.
//!
//! One reader thread per process appends every line to a bounded buffer and
//! forwards it to at most one live subscriber. Appending and forwarding happen
//! while holding the subscriber slot, so swapping the subscriber is atomic
//! with respect to line delivery: every line lands in the buffer exactly once
//! and reaches exactly the subscriber that was installed when it was read.

use std::collections::VecDeque;
use std::error::Error;
use std::io::{self, BufRead, BufReader, PipeReader};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, ExitStatus};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use log::{debug, error, warn};
use parking_lot::Mutex;

pub type DeliveryResult = Result<(), Box<dyn Error + Send + Sync>>;

/// A live consumer of output lines.
pub struct Subscriber {
    name: String,
    deliver: Box<dyn FnMut(&str) -> DeliveryResult + Send>,
    failures: usize,
}

impl Subscriber {
    pub fn new<F>(name: impl Into<String>, deliver: F) -> Self
    where
        F: FnMut(&str) -> DeliveryResult + Send + 'static,
    {
        Self {
            name: name.into(),
            deliver: Box::new(deliver),
            failures: 0,
        }
    }

    /// Forwards every line into a channel.
    pub fn channel(name: impl Into<String>, sender: Sender<String>) -> Self {
        Self::new(name, move |line| sender.send(line.to_string()).map_err(Into::into))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns false if the subscriber panicked and must be dropped.
    fn offer(&mut self, line: &str) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.deliver)(line))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.failures += 1;
                if self.failures == 1 {
                    warn!("Subscriber '{}' failed to take output: {}", self.name, e);
                } else {
                    debug!("Subscriber '{}' failed again ({} failures): {}", self.name, self.failures, e);
                }
                true
            }
            Err(_) => {
                error!("Subscriber '{}' panicked; detaching it.", self.name);
                false
            }
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("name", &self.name)
            .field("failures", &self.failures)
            .finish()
    }
}

#[derive(Debug)]
struct LineBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    total: usize,
}

impl LineBuffer {
    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.total += 1;
    }

    fn tail(&self, last_n: Option<usize>) -> Vec<String> {
        let n = last_n.unwrap_or(self.lines.len()).min(self.lines.len());
        self.lines.iter().skip(self.lines.len() - n).cloned().collect()
    }
}

/// What the slot held and how many lines had been collected when a
/// subscriber swap took effect.
#[derive(Debug)]
pub struct Handoff {
    pub previous: Option<Subscriber>,
    pub lines: usize,
}

/// Output state shared between a collector thread and its readers.
///
/// Lock order is `subscriber` then `buffer`; snapshots only take `buffer`.
#[derive(Debug)]
pub struct Output {
    subscriber: Mutex<Option<Subscriber>>,
    buffer: Mutex<LineBuffer>,
}

impl Output {
    pub fn new(capacity: usize, subscriber: Option<Subscriber>) -> Self {
        Self {
            subscriber: Mutex::new(subscriber),
            buffer: Mutex::new(LineBuffer {
                lines: VecDeque::new(),
                capacity: capacity.max(1),
                total: 0,
            }),
        }
    }

    pub fn push(&self, line: String) {
        let mut slot = self.subscriber.lock();
        if let Some(subscriber) = slot.as_mut() {
            if !subscriber.offer(&line) {
                *slot = None;
            }
        }
        self.buffer.lock().push(line);
    }

    /// Copies the most recent `last_n` retained lines (all of them for `None`).
    pub fn snapshot(&self, last_n: Option<usize>) -> Vec<String> {
        self.buffer.lock().tail(last_n)
    }

    /// Number of lines collected so far, including trimmed ones.
    pub fn total_lines(&self) -> usize {
        self.buffer.lock().total
    }

    pub fn retained_lines(&self) -> usize {
        self.buffer.lock().lines.len()
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.lock().is_some()
    }

    pub fn replace_subscriber(&self, next: Option<Subscriber>) -> Handoff {
        let mut slot = self.subscriber.lock();
        let lines = self.buffer.lock().total;
        let previous = std::mem::replace(&mut *slot, next);
        Handoff { previous, lines }
    }

    /// Installs `subscriber` and returns the last `backlog` lines it has not
    /// been sent, with no line falling between the two.
    pub fn subscribe(&self, subscriber: Subscriber, backlog: usize) -> (Vec<String>, Option<Subscriber>) {
        let mut slot = self.subscriber.lock();
        let seed = self.buffer.lock().tail(Some(backlog));
        let previous = slot.replace(subscriber);
        (seed, previous)
    }
}

/// Starts the reader for one process. After end-of-stream the thread reaps the
/// child and hands its exit status to `on_exit`.
pub fn spawn_collector<F>(
    name: String,
    stream: PipeReader,
    mut child: Child,
    output: std::sync::Arc<Output>,
    on_exit: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce(io::Result<ExitStatus>) + Send + 'static,
{
    thread::Builder::new().name(name).spawn(move || {
        drain(stream, &output);
        on_exit(child.wait());
    })
}

fn drain(stream: PipeReader, output: &Output) {
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => output.push(decode_line(&raw)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Output stream closed with error: {}", e);
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

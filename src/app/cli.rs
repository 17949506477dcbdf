use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Context;
use crossbeam_channel::{select, unbounded, Receiver};
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute, terminal,
};
use log::warn;

use crate::app::browser::TaskBrowser;
use crate::config::ShellArgs;
use crate::error::TaskError;
use crate::manager::bridge::{ForegroundOutcome, ForegroundRunner};
use crate::manager::task_manager::TaskManager;
use crate::models::message::ShellCommand;
use crate::models::task::{describe_command, TaskStatus};
use crate::worker::collector::Subscriber;

const KEY_POLL: Duration = Duration::from_millis(50);
const FOLLOW_BATCH: usize = 64;

const HELP: &str = "\
Commands:
  run <command>    run in the foreground (Ctrl+C offers to background it)
  bg <command>     start a background task
  tasks | list     list background tasks (Ctrl+B at the prompt)
  view <id> [n]    show the last n lines of a task's output
  attach <id>      follow a running task's output (Ctrl+C or q detaches)
  kill <id>        SIGKILL a task's process group
  term <id>        SIGTERM a task's process group
  rm <id>          remove a finished task
  exit             kill all background tasks and quit";

pub fn run_cli(manager: &TaskManager, args: &ShellArgs) -> anyhow::Result<()> {
    let raw_mode = RawMode::enable()?;
    println!("\rTask shell started. Enter a command, `help`, or `exit` to quit.");
    let mut history = History::default();

    loop {
        announce_completions(manager);

        let input = match read_line(&prompt(manager), &mut history)? {
            Input::Line(line) => line,
            Input::Tasks => {
                print_block(&TaskBrowser::new(manager).table());
                continue;
            }
            Input::Interrupt => {
                println!("\rUse `exit` to quit, or Ctrl+D.");
                continue;
            }
            Input::Eof => break,
        };
        history.push(&input);

        let command = match ShellCommand::parse(&input) {
            Ok(ShellCommand::Exit) => break,
            Ok(command) => command,
            Err(e) => {
                println!("\r{e}");
                continue;
            }
        };
        if let Err(e) = dispatch(manager, args, command) {
            match e.downcast_ref::<TaskError>() {
                Some(task_error) => println!("\r{task_error} ({}).", task_error.suggestion()),
                None => return Err(e),
            }
        }
    }

    println!("\rExiting...");
    let killed = manager.cleanup_all();
    if killed > 0 {
        println!("\rKilled {killed} background task(s).");
    }
    drop(raw_mode);
    Ok(())
}

fn dispatch(manager: &TaskManager, args: &ShellArgs, command: ShellCommand) -> anyhow::Result<()> {
    let browser = TaskBrowser::new(manager);
    match command {
        ShellCommand::Run(command) => run_foreground(manager, args, &command)?,
        ShellCommand::Background(command) => {
            let id = manager.create(&command, &describe_command(&command))?;
            println!("\rBackground task #{id} started. Use `view {id}` or `attach {id}`.");
        }
        ShellCommand::List => print_block(&browser.table()),
        ShellCommand::View(id, count) => print_block(&browser.view(id, count)?),
        ShellCommand::Attach(id) => attach(manager, id)?,
        ShellCommand::Kill(id) => println!("\r{}", browser.kill(id)?),
        ShellCommand::Terminate(id) => println!("\r{}", browser.terminate(id)?),
        ShellCommand::Remove(id) => println!("\r{}", browser.remove(id)?),
        ShellCommand::Help => print_block(HELP),
        ShellCommand::Exit | ShellCommand::Empty => {}
    }
    Ok(())
}

fn run_foreground(manager: &TaskManager, args: &ShellArgs, command: &str) -> anyhow::Result<()> {
    let description = describe_command(command);
    println!("\rRunning `{description}` (Ctrl+C to interrupt)");

    let display = Subscriber::new("foreground", |line| {
        let mut out = io::stdout().lock();
        write!(out, "\r{line}\r\n")?;
        out.flush()?;
        Ok(())
    });
    let mut watcher = InterruptWatcher::start()?;
    let interrupts = watcher.receiver();
    let runner = ForegroundRunner::new(manager, args.foreground_timeout());
    let outcome = runner.run(command, &description, display, &interrupts, || {
        watcher.stop();
        confirm("Background this task? [y/N]: ")
    });
    watcher.stop();

    match outcome? {
        ForegroundOutcome::Finished {
            status: TaskStatus::Completed,
            ..
        } => {}
        ForegroundOutcome::Finished { status, exit_code, .. } => {
            println!("\rCommand {} (exit code {}).", status.as_str().to_lowercase(), format_code(exit_code));
        }
        ForegroundOutcome::Backgrounded { id, .. } => {
            println!("\rBackgrounded as task #{id}. Ctrl+B to list tasks.");
        }
        ForegroundOutcome::Cancelled { .. } => println!("\rCancelled by user."),
        ForegroundOutcome::TimedOut { after, .. } => {
            println!(
                "\rThe command timed out after {} seconds. Retry with a higher --timeout or run it with `bg`.",
                after.as_secs()
            );
        }
    }
    Ok(())
}

fn attach(manager: &TaskManager, id: u64) -> anyhow::Result<()> {
    let task = manager.get(id)?;
    let (sender, lines) = unbounded();
    let backlog = TaskBrowser::new(manager).attach(id, Subscriber::channel(format!("attach-{id}"), sender))?;

    println!("\rAttached to task #{id}. Press Ctrl+C or q to detach.");
    for line in backlog {
        println!("\r{line}");
    }

    let mut stdout = io::stdout();
    let result = follow(&lines, task.execution().done(), &mut stdout, detach_key_pressed);
    task.detach();
    for line in lines.try_iter() {
        println!("\r{line}");
    }
    result?;

    if task.status().is_terminal() {
        println!("\rTask #{id} {} (exit code {}).", task.status(), format_code(task.exit_code()));
    }
    println!("\rDetached.");
    Ok(())
}

/// Prints lines until the task finishes, the subscriber hangs up, or
/// `detach_requested` says so. The detach check runs before every batch.
fn follow<W: Write>(
    lines: &Receiver<String>,
    done: &Receiver<()>,
    out: &mut W,
    mut detach_requested: impl FnMut() -> io::Result<bool>,
) -> io::Result<()> {
    loop {
        if detach_requested()? {
            return Ok(());
        }
        select! {
            recv(lines) -> line => match line {
                Ok(line) => {
                    writeln!(out, "\r{line}")?;
                    for line in lines.try_iter().take(FOLLOW_BATCH) {
                        writeln!(out, "\r{line}")?;
                    }
                    out.flush()?;
                }
                Err(_) => return Ok(()),
            },
            recv(done) -> _ => return Ok(()),
            default(KEY_POLL) => {}
        }
    }
}

fn detach_key_pressed() -> io::Result<bool> {
    while event::poll(Duration::ZERO)? {
        if let Event::Key(key) = event::read()? {
            if is_detach(&key) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn announce_completions(manager: &TaskManager) {
    for task in manager.take_completions() {
        let word = match task.status {
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "was killed",
            TaskStatus::Running => continue,
        };
        println!(
            "\rBackground task #{} ({}) {} (exit code {}).",
            task.id,
            task.description,
            word,
            format_code(task.exit_code)
        );
    }
}

fn prompt(manager: &TaskManager) -> String {
    match manager.running_count() {
        0 => ">>> ".to_string(),
        running => format!("[{running} bg] >>> "),
    }
}

fn format_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |code| code.to_string())
}

fn print_block(text: &str) {
    for line in text.lines() {
        println!("\r{line}");
    }
}

fn confirm(question: &str) -> bool {
    let answer = (|| -> io::Result<bool> {
        print!("\r{question}");
        io::stdout().flush()?;
        loop {
            if let Event::Key(key) = event::read()? {
                if !is_press(&key) {
                    continue;
                }
                let yes = matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y')) && !is_interrupt(&key);
                println!("{}", if yes { "y" } else { "n" });
                return Ok(yes);
            }
        }
    })();
    answer.unwrap_or_else(|e| {
        warn!("Failed to read confirmation: {}", e);
        false
    })
}

fn is_press(key: &KeyEvent) -> bool {
    key.kind == KeyEventKind::Press
}

fn is_interrupt(key: &KeyEvent) -> bool {
    is_press(key) && key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
}

fn is_detach(key: &KeyEvent) -> bool {
    is_interrupt(key) || (is_press(key) && key.modifiers.is_empty() && key.code == KeyCode::Char('q'))
}

enum Input {
    Line(String),
    Tasks,
    Interrupt,
    Eof,
}

fn read_line(prompt: &str, history: &mut History) -> io::Result<Input> {
    print!("\r{prompt}");
    io::stdout().flush()?;

    let mut input = String::new();
    loop {
        let Event::Key(key_event) = event::read()? else {
            continue;
        };
        if !is_press(&key_event) {
            continue;
        }
        if key_event.modifiers.contains(KeyModifiers::CONTROL) {
            match key_event.code {
                KeyCode::Char('c') => {
                    println!();
                    return Ok(Input::Interrupt);
                }
                KeyCode::Char('d') if input.is_empty() => {
                    println!();
                    return Ok(Input::Eof);
                }
                KeyCode::Char('b') => {
                    println!();
                    return Ok(Input::Tasks);
                }
                _ => continue,
            }
        }
        match key_event.code {
            KeyCode::Enter => {
                println!();
                return Ok(Input::Line(input));
            }
            KeyCode::Up => {
                if let Some(entry) = history.older() {
                    input = entry.to_string();
                    redraw(prompt, &input)?;
                }
            }
            KeyCode::Down => {
                input = history.newer().unwrap_or_default().to_string();
                redraw(prompt, &input)?;
            }
            KeyCode::Char(c) => {
                input.push(c);
                print!("{c}");
                io::stdout().flush()?;
            }
            KeyCode::Backspace => {
                input.pop();
                redraw(prompt, &input)?;
            }
            _ => {}
        }
    }
}

fn redraw(prompt: &str, input: &str) -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )?;
    print!("{prompt}{input}");
    io::stdout().flush()
}

struct RawMode;

impl RawMode {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Failed to disable raw mode: {}", e);
        }
    }
}

/// Input history navigated with Up/Down.
#[derive(Debug, Default)]
struct History {
    entries: Vec<String>,
    cursor: usize,
}

impl History {
    fn push(&mut self, entry: &str) {
        if !entry.trim().is_empty() && self.entries.last().map(String::as_str) != Some(entry) {
            self.entries.push(entry.to_string());
        }
        self.cursor = self.entries.len();
    }

    fn older(&mut self) -> Option<&str> {
        if self.cursor == 0 {
            return self.entries.first().map(String::as_str);
        }
        self.cursor -= 1;
        self.entries.get(self.cursor).map(String::as_str)
    }

    /// `None` once the cursor moves past the newest entry.
    fn newer(&mut self) -> Option<&str> {
        if self.cursor < self.entries.len() {
            self.cursor += 1;
        }
        self.entries.get(self.cursor).map(String::as_str)
    }
}

/// Watches the terminal for Ctrl+C while a foreground command owns the screen.
struct InterruptWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    receiver: Receiver<()>,
}

impl InterruptWatcher {
    fn start() -> io::Result<Self> {
        let (sender, receiver) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new().name("interrupt-watcher".into()).spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                match event::poll(KEY_POLL) {
                    Ok(false) => {}
                    Ok(true) => match event::read() {
                        Ok(Event::Key(key)) if is_interrupt(&key) => {
                            if sender.send(()).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Failed to read terminal event: {}", e);
                            break;
                        }
                    },
                    Err(e) => {
                        warn!("Failed to poll terminal events: {}", e);
                        break;
                    }
                }
            }
        })?;
        Ok(Self {
            stop,
            handle: Some(handle),
            receiver,
        })
    }

    fn receiver(&self) -> Receiver<()> {
        self.receiver.clone()
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InterruptWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

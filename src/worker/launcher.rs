//! Starting commands in their own process group and signalling that group.

use std::io::{self, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use log::debug;

use crate::error::{Result, TaskError};

#[cfg(unix)]
const SYSTEM_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How hard to ask a process group to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Graceful,
    Forced,
}

/// The group a launched command and all of its descendants belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: u32,
}

impl ProcessGroup {
    pub fn id(&self) -> u32 {
        self.pgid
    }

    #[cfg(unix)]
    pub fn terminate(&self, signal: Signal) -> io::Result<()> {
        let signo = match signal {
            Signal::Graceful => libc::SIGTERM,
            Signal::Forced => libc::SIGKILL,
        };
        let rc = unsafe { libc::killpg(self.pgid as libc::pid_t, signo) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn terminate(&self, signal: Signal) -> io::Result<()> {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &self.pgid.to_string(), "/T"]);
        if signal == Signal::Forced {
            cmd.arg("/F");
        }
        let status = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}

/// A freshly spawned process: the child to reap, the merged
/// stdout/stderr stream to drain, and the group to signal.
#[derive(Debug)]
pub struct ProcessHandle {
    pub child: Child,
    pub output: PipeReader,
    pub group: ProcessGroup,
}

pub fn launch(command: &str, env: &[(String, String)], working_dir: Option<&Path>) -> Result<ProcessHandle> {
    spawn(command, env, working_dir).map_err(|source| TaskError::Launch {
        command: command.to_string(),
        source,
    })
}

fn spawn(command: &str, env: &[(String, String)], working_dir: Option<&Path>) -> io::Result<ProcessHandle> {
    let (reader, writer) = io::pipe()?;

    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);

    #[cfg(unix)]
    {
        let path = std::env::var("PATH").unwrap_or_default();
        cmd.env("PATH", format!("{SYSTEM_PATH}:{path}"));
    }
    cmd.envs(env.iter().map(|(key, value)| (key, value)));
    if let Some(dir) = working_dir.map(Path::to_path_buf).or_else(default_working_dir) {
        cmd.current_dir(dir);
    }
    detach_from_terminal(&mut cmd);

    let child = cmd.spawn()?;
    // The command still holds our copies of the pipe's write end; the
    // reader only sees EOF once they are closed.
    drop(cmd);

    let group = ProcessGroup { pgid: child.id() };
    debug!("Launched `{}` as process group {}.", command, group.pgid);
    Ok(ProcessHandle {
        child,
        output: reader,
        group,
    })
}

/// Commands without an explicit directory start in the user's home, falling
/// back to the shell's own directory when there is none.
fn default_working_dir() -> Option<PathBuf> {
    dirs::home_dir().filter(|home| home.is_dir())
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(unix)]
fn detach_from_terminal(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // New session: the child leads its own process group and never
    // receives signals generated by the shell's terminal.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach_from_terminal(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach_from_terminal(_cmd: &mut Command) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn merges_stdout_and_stderr_into_one_stream() {
        let mut handle = launch("echo out; echo err 1>&2", &[], None).expect("launch");
        let mut text = String::new();
        handle.output.read_to_string(&mut text).expect("read");
        handle.child.wait().expect("wait");
        assert_eq!(text, "out\nerr\n");
    }

    #[test]
    fn child_leads_its_own_process_group() {
        let mut handle = launch("sleep 5", &[], None).expect("launch");
        let pgid = unsafe { libc::getpgid(handle.group.id() as libc::pid_t) };
        assert_eq!(pgid as u32, handle.group.id());
        assert_ne!(pgid, unsafe { libc::getpgrp() });

        handle.group.terminate(Signal::Forced).expect("kill");
        let status = handle.child.wait().expect("wait");
        assert!(!status.success());
    }

    #[test]
    fn extra_environment_and_working_directory_are_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = vec![("TASK_SHELL_GREETING".to_string(), "hello".to_string())];
        let mut handle = launch("echo $TASK_SHELL_GREETING; pwd", &env, Some(dir.path())).expect("launch");
        let mut text = String::new();
        handle.output.read_to_string(&mut text).expect("read");
        handle.child.wait().expect("wait");

        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("hello"));
        let cwd = std::path::PathBuf::from(lines.next().expect("pwd line"));
        assert_eq!(
            cwd.canonicalize().expect("canonical cwd"),
            dir.path().canonicalize().expect("canonical tempdir")
        );
    }

    #[test]
    fn commands_start_in_the_home_directory_by_default() {
        let Some(home) = default_working_dir() else {
            return;
        };
        let mut handle = launch("pwd", &[], None).expect("launch");
        let mut text = String::new();
        handle.output.read_to_string(&mut text).expect("read");
        handle.child.wait().expect("wait");

        let cwd = std::path::PathBuf::from(text.trim_end());
        assert_eq!(
            cwd.canonicalize().expect("canonical cwd"),
            home.canonicalize().expect("canonical home")
        );
    }

    #[test]
    fn missing_working_directory_is_a_launch_error() {
        let err = launch("true", &[], Some(Path::new("/nonexistent/task-shell-dir"))).unwrap_err();
        assert!(matches!(err, TaskError::Launch { .. }), "unexpected error: {err}");
    }
}

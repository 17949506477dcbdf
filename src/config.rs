use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_MAX_OUTPUT_LINES: usize = 10_000;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_FOREGROUND_TIMEOUT: Duration = Duration::from_secs(300);

/// Command line options of the interactive shell.
#[derive(Debug, Clone, Parser)]
#[command(name = "task-shell", version, about = "Interactive shell with background task control")]
pub struct ShellArgs {
    /// Timeout in seconds for commands run in the foreground
    #[arg(long, env = "TASK_SHELL_TIMEOUT", default_value_t = DEFAULT_FOREGROUND_TIMEOUT.as_secs())]
    pub timeout: u64,

    /// Number of output lines retained per task
    #[arg(long, env = "TASK_SHELL_MAX_OUTPUT_LINES", default_value_t = DEFAULT_MAX_OUTPUT_LINES)]
    pub max_output_lines: usize,

    /// Grace period before a graceful termination escalates to SIGKILL
    #[arg(long, env = "TASK_SHELL_KILL_GRACE_MS", default_value_t = DEFAULT_KILL_GRACE.as_millis() as u64)]
    pub kill_grace_ms: u64,

    /// Working directory for launched commands
    #[arg(long, env = "TASK_SHELL_CWD")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variable for launched commands (KEY=VALUE)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Log filter passed to env_logger
    #[arg(long, env = "TASK_SHELL_LOG", default_value = "warn")]
    pub log_level: String,
}

impl ShellArgs {
    pub fn foreground_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            max_output_lines: self.max_output_lines.max(1),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            working_dir: self.cwd.clone(),
            env: self.env.clone(),
        }
    }
}

/// Settings shared by every task a [`TaskManager`](crate::manager::task_manager::TaskManager) launches.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub max_output_lines: usize,
    pub kill_grace: Duration,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            kill_grace: DEFAULT_KILL_GRACE,
            working_dir: None,
            env: Vec::new(),
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

//! Interactive shell core for running commands in the foreground or as
//! tracked background tasks, with Ctrl+C handoff from one to the other.
//!
//! Every launched command gets its own process group and a dedicated
//! collector thread. The [`TaskManager`] owns background tasks; the
//! [`ForegroundRunner`] owns synchronous runs until the user either lets
//! them finish, cancels them, or adopts them into the manager.

pub mod app;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod worker;

pub use config::{ShellArgs, TaskConfig};
pub use error::{Result, TaskError};
pub use manager::bridge::{ForegroundOutcome, ForegroundRunner};
pub use manager::task_manager::TaskManager;
pub use models::task::{KillOutcome, TaskInfo, TaskStatus};
pub use worker::collector::Subscriber;

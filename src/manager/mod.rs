pub mod bridge;
pub mod execution;
pub mod task;
pub mod task_manager;

use clap::Parser;

use task_shell::app::cli;
use task_shell::{ShellArgs, TaskManager};

fn main() -> anyhow::Result<()> {
    let args = ShellArgs::parse();
    env_logger::Builder::new().parse_filters(&args.log_level).init();

    let manager = TaskManager::new(args.task_config());
    cli::run_cli(&manager, &args)
}

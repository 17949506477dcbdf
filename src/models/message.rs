use thiserror::Error;

/// One line of user input, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Run(String),
    Background(String),
    List,
    View(u64, Option<usize>),
    Attach(u64),
    Kill(u64),
    Terminate(u64),
    Remove(u64),
    Help,
    Exit,
    Empty,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Command to execute must be specified.")]
    MissingCommand,
    #[error("Task ID must be specified.")]
    MissingId,
    #[error("Invalid task ID format: `{0}`.")]
    InvalidId(String),
    #[error("Invalid line count: `{0}`.")]
    InvalidCount(String),
    #[error("Unknown command: {0}. Type `help` for a list of commands.")]
    Unknown(String),
}

impl ShellCommand {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim();
        let (verb, rest) = match input.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (input, ""),
        };

        match verb {
            "" => Ok(ShellCommand::Empty),
            "run" => command_arg(rest).map(ShellCommand::Run),
            "bg" => command_arg(rest).map(ShellCommand::Background),
            "tasks" | "list" => Ok(ShellCommand::List),
            "view" => {
                let mut args = rest.split_whitespace();
                let id = id_arg(args.next())?;
                let count = args
                    .next()
                    .map(|raw| raw.parse::<usize>().map_err(|_| ParseError::InvalidCount(raw.to_string())))
                    .transpose()?;
                Ok(ShellCommand::View(id, count))
            }
            "attach" => id_arg(rest.split_whitespace().next()).map(ShellCommand::Attach),
            "kill" => id_arg(rest.split_whitespace().next()).map(ShellCommand::Kill),
            "term" => id_arg(rest.split_whitespace().next()).map(ShellCommand::Terminate),
            "rm" => id_arg(rest.split_whitespace().next()).map(ShellCommand::Remove),
            "help" => Ok(ShellCommand::Help),
            "exit" | "quit" => Ok(ShellCommand::Exit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn command_arg(rest: &str) -> Result<String, ParseError> {
    if rest.is_empty() {
        Err(ParseError::MissingCommand)
    } else {
        Ok(rest.to_string())
    }
}

fn id_arg(raw: Option<&str>) -> Result<u64, ParseError> {
    let raw = raw.ok_or(ParseError::MissingId)?;
    raw.trim_start_matches('#')
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidId(raw.to_string()))
}

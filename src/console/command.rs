use clap::{Parser, ValueEnum};

/// Host console command, the first word of the line is the command name.
#[derive(Parser, Debug, PartialEq)]
#[command(multicall = true, disable_help_subcommand = true)]
pub enum ConsoleCommand {
    /// Start the update server.
    Start,
    /// Stop the update server and disconnect all clients.
    Stop,
    /// Show the server state and connected clients.
    Status,
    /// Send an update to clients right now.
    Update,
    /// Switch debug logging.
    Debug {
        #[arg(value_enum)]
        mode: DebugMode,
    },
    /// Execute one instruction.
    #[command(alias = "si")]
    Stepi,
    /// Continue the debuggee until the next signal.
    #[command(alias = "c")]
    Continue,
    /// Show help.
    #[command(alias = "h")]
    Help,
    /// Stop the server and exit.
    #[command(alias = "q")]
    Quit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum DebugMode {
    Enable,
    Disable,
}

impl ConsoleCommand {
    pub fn parse_line(line: &str) -> Result<Self, clap::Error> {
        Self::try_parse_from(line.split_whitespace())
    }
}

/// Names offered by completion.
pub const COMMAND_NAMES: &[&str] = &[
    "start", "stop", "status", "update", "debug", "stepi", "continue", "help", "quit",
];

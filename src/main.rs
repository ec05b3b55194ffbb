use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nix::unistd::Pid;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stopcast::client::{ConnectOptions, Connector};
use stopcast::config::Config;
use stopcast::console::AppBuilder;
use stopcast::host::parse_number;
use stopcast::host::target::Target;
use stopcast::proto::{
    ClientConfig, ClientKind, Message, Query, QueryValue, RegisterValue, UpdateData, UpdateOn,
};
use stopcast::view::{self, Screen};
use stopcast::weak_error;

/// How long one-shot clients wait for the server.
const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bytes shown from `pc` by `query watch`.
const WATCH_LEN: u64 = 32;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server socket.
    #[arg(long, global = true, env = "STOPCAST_SOCKET")]
    socket: Option<PathBuf>,

    /// Config file, `~/.config/stopcast/config.toml` by default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run or attach to a debuggee and open the host console.
    Host {
        /// Attach to a running process.
        #[arg(long, conflicts_with = "program")]
        pid: Option<i32>,
        /// Program to run and its arguments.
        #[arg(last = true)]
        program: Vec<String>,
    },
    /// Show updates of one kind as they arrive.
    View {
        kind: ClientKind,
        /// Debugger command for the `cmd` kind.
        #[arg(long)]
        command: Option<String>,
        /// Receive relayed updates only.
        #[arg(long)]
        manual: bool,
        /// Exit when the server goes away.
        #[arg(long)]
        no_reconnect: bool,
    },
    /// Relay a JSON payload to every client of a kind.
    Push {
        kind: ClientKind,
        /// Payload file, `-` for stdin.
        file: PathBuf,
    },
    /// Ask the debugger a question.
    Query {
        #[command(subcommand)]
        query: QueryCommand,
    },
}

#[derive(Subcommand, Debug)]
enum QueryCommand {
    /// Register value.
    Register { name: String },
    /// Memory in [START, END).
    Memory {
        #[arg(value_parser = number)]
        start: u64,
        #[arg(value_parser = number)]
        end: u64,
    },
    /// Print memory at `pc` on every stop.
    Watch,
}

fn number(text: &str) -> Result<u64, String> {
    parse_number(text).ok_or_else(|| format!("`{text}` is not a number"))
}

fn main() -> anyhow::Result<()> {
    stopcast::log::init();
    if io::stdout().is_terminal() {
        view::style::enable_colors();
    }

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref());
    if let Some(socket) = args.socket {
        config.socket = Some(socket);
    }

    match args.command {
        Command::Host { pid, program } => host(&config, pid, program),
        Command::View {
            kind,
            command,
            manual,
            no_reconnect,
        } => {
            let mut client_config = ClientConfig::new(kind);
            client_config.command = command;
            if manual {
                client_config = client_config.with_update_on(UpdateOn::Manual);
            }
            if kind == ClientKind::Cmd && client_config.command.is_none() {
                bail!("`cmd` view needs --command");
            }
            watch_updates(&config, client_config, !no_reconnect)
        }
        Command::Push { kind, file } => push(&config, kind, file),
        Command::Query { query } => self::query(&config, query),
    }
}

fn host(config: &Config, pid: Option<i32>, program: Vec<String>) -> anyhow::Result<()> {
    let target = match (pid, program.split_first()) {
        (Some(pid), _) => Some(Target::attach(Pid::from_raw(pid))?),
        (None, Some((program, args))) => Some(Target::spawn(program, args)?),
        (None, None) => None,
    };

    let app = AppBuilder::new(config.socket_path())
        .history(config.history_path())
        .build(target)?;
    app.run()
}

fn watch_updates(
    config: &Config,
    client_config: ClientConfig,
    reconnect: bool,
) -> anyhow::Result<()> {
    let screen = Arc::new(Mutex::new(Screen::new(
        io::stdout(),
        client_config.to_string(),
    )));

    let options = ConnectOptions {
        reconnect: reconnect && config.reconnect,
        ..config.connect_options()
    };
    let options = {
        let screen = screen.clone();
        options.with_status(move |status| {
            let mut screen = screen.lock().unwrap_or_else(PoisonError::into_inner);
            weak_error!(screen.status(status));
        })
    };

    let mut connector = Connector::connect(config.socket_path(), client_config, options)?;
    connector.run(|message| {
        let mut screen = screen.lock().unwrap_or_else(PoisonError::into_inner);
        weak_error!(screen.message(&message));
    })?;
    Ok(())
}

fn one_shot(config: &Config, client_config: ClientConfig) -> anyhow::Result<Connector> {
    let options = ConnectOptions {
        reconnect: false,
        connect_timeout: Some(ONE_SHOT_TIMEOUT),
        ..config.connect_options()
    };
    Connector::connect(config.socket_path(), client_config, options)
        .with_context(|| format!("connect to {}", config.socket_path().display()))
}

fn push(config: &Config, kind: ClientKind, file: PathBuf) -> anyhow::Result<()> {
    let payload = if file.as_os_str() == "-" {
        let mut payload = String::new();
        io::stdin().read_to_string(&mut payload)?;
        payload
    } else {
        std::fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?
    };
    let data: serde_json::Value = serde_json::from_str(&payload).context("parse payload")?;

    let proxy = ClientConfig::new(ClientKind::View).with_update_on(UpdateOn::Manual);
    let mut connector = one_shot(config, proxy)?;
    connector.push(kind, data)?;
    connector.close();
    Ok(())
}

fn query(config: &Config, query: QueryCommand) -> anyhow::Result<()> {
    let mut connector = one_shot(config, ClientConfig::new(ClientKind::Interactive))?;

    match query {
        QueryCommand::Register { name } => {
            let value = connector.query(Query::GetRegister {
                register: name.clone(),
            })?;
            match value {
                Some(QueryValue::Register(RegisterValue::Int(v))) => println!("{name} = {v:#x}"),
                Some(QueryValue::Register(RegisterValue::Text(text))) => println!("{name} = {text}"),
                _ => println!("{name}: no value"),
            }
        }
        QueryCommand::Memory { start, end } => {
            match connector.query(Query::GetMemory { start, end })? {
                Some(QueryValue::Memory(data)) => println!("{}", view::hexdump(start, &data)),
                _ => println!("memory {start:#x}..{end:#x}: no value"),
            }
        }
        QueryCommand::Watch => {
            let (tx, rx) = mpsc::channel();
            connector.start_callback_thread(Arc::new(Mutex::new(tx)), |tx, message| {
                if let Message::Update {
                    data: UpdateData::Stopped { pc },
                    ..
                } = message
                {
                    _ = tx.send(pc);
                }
            })?;

            // ends when the callback thread drops the sender on disconnect
            for pc in rx {
                println!("stopped at {pc:#018x}");
                let query = Query::GetMemory {
                    start: pc,
                    end: pc.saturating_add(WATCH_LEN),
                };
                match connector.query(query)? {
                    Some(QueryValue::Memory(data)) => println!("{}", view::hexdump(pc, &data)),
                    _ => println!("memory at pc not readable"),
                }
            }
            println!("disconnected from debugger");
        }
    }

    connector.close();
    Ok(())
}

//! Host console: controls the update server and steps the debuggee.
//!
//! The console thread is the tracer thread, so the stop-hook (register capture followed by
//! [`Server::update_clients`]) runs right after every `stepi` and `continue`.

use crate::adapter::DebuggerAdapter;
use crate::console::command::{ConsoleCommand, DebugMode};
use crate::console::editor::{create_editor, ConsoleEditor};
use crate::console::help::HELP;
use crate::host::target::{StopReason, Target};
use crate::host::ProcessAdapter;
use crate::server::{Server, ServerError};
use crate::view::style::{AddressView, ErrorView, StatusView};
use crate::{muted_error, weak_error};
use anyhow::Context;
use log::debug;
use nix::sys::signal::{signal, SigHandler, Signal};
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

pub mod command;
mod editor;
mod help;

const WELCOME_TEXT: &str = r#"
stopcast host console, type `help` for commands
"#;
const PROMPT: &str = "(stopcast) ";

pub struct AppBuilder {
    socket_path: PathBuf,
    history_path: Option<PathBuf>,
}

impl AppBuilder {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            history_path: None,
        }
    }

    pub fn history(self, path: Option<PathBuf>) -> Self {
        Self {
            history_path: path,
            ..self
        }
    }

    /// Build the console around an already stopped debuggee, if any.
    pub fn build(self, target: Option<Target>) -> anyhow::Result<TerminalApplication> {
        let mut editor = create_editor(PROMPT)?;
        if let Some(ref path) = self.history_path {
            muted_error!(editor.load_history(path), "load history:");
        }

        let adapter = Arc::new(ProcessAdapter::new());
        let server = Server::new(
            self.socket_path,
            adapter.clone() as Arc<dyn DebuggerAdapter>,
        );
        let mut app_loop = AppLoop {
            server,
            adapter,
            target: None,
            out: io::stdout(),
        };
        if let Some(target) = target {
            app_loop.install(target);
        }

        Ok(TerminalApplication {
            app_loop,
            editor,
            history_path: self.history_path,
        })
    }
}

pub struct TerminalApplication {
    app_loop: AppLoop<io::Stdout>,
    editor: ConsoleEditor,
    history_path: Option<PathBuf>,
}

impl TerminalApplication {
    pub fn run(mut self) -> anyhow::Result<()> {
        // ctrl-c interrupts the debuggee (same process group), not the console
        unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }
            .context("ignore SIGINT in console")?;

        println!("{WELCOME_TEXT}");
        loop {
            match self.editor.readline(PROMPT) {
                Ok(input) => {
                    let input = input.trim();
                    if input.is_empty() {
                        continue;
                    }
                    _ = self.editor.add_history_entry(input);

                    match ConsoleCommand::parse_line(input) {
                        Ok(cmd) => match self.app_loop.handle_command(cmd) {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Quit) => break,
                            Err(e) => self.app_loop.print_error(e),
                        },
                        // clap renders its own usage text
                        Err(e) => {
                            _ = e.print();
                        }
                    }
                }
                Err(ReadlineError::Eof | ReadlineError::Interrupted) => break,
                Err(err) => {
                    println!("error: {err:#}");
                    break;
                }
            }
        }

        if let Some(ref path) = self.history_path {
            weak_error!(self.editor.save_history(path), "save history:");
        }
        if self.app_loop.server.is_running() {
            weak_error!(self.app_loop.server.stop());
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

struct AppLoop<W: Write> {
    server: Server,
    adapter: Arc<ProcessAdapter>,
    target: Option<Target>,
    out: W,
}

impl<W: Write> AppLoop<W> {
    fn print(&mut self, msg: impl AsRef<str>) {
        _ = writeln!(self.out, "{}", msg.as_ref());
    }

    fn print_error(&mut self, e: anyhow::Error) {
        self.print(format!("{}", ErrorView::from(format!("error: {e:#}"))));
    }

    fn install(&mut self, target: Target) {
        self.print(format!(
            "debuggee {} ({})",
            target.program(),
            target.pid()
        ));
        weak_error!(self.adapter.capture(&target), "capture registers:");
        self.target = Some(target);
    }

    fn handle_command(&mut self, cmd: ConsoleCommand) -> anyhow::Result<Flow> {
        match cmd {
            ConsoleCommand::Start => {
                self.server.start()?;
                let path = self.server.socket_path().display().to_string();
                self.print(format!("server listening on {path}"));
            }
            ConsoleCommand::Stop => {
                self.server.stop()?;
                self.print("server stopped");
            }
            ConsoleCommand::Status => self.status(),
            ConsoleCommand::Update => {
                if !self.server.is_running() {
                    return Err(ServerError::NotRunning.into());
                }
                let stats = self.server.update_clients();
                self.print(format!(
                    "updated {} client(s), skipped {}, disconnected {}",
                    stats.delivered, stats.skipped, stats.purged
                ));
            }
            ConsoleCommand::Debug { mode } => match mode {
                DebugMode::Enable => {
                    crate::log::enable_debug();
                    self.print("debug logging enabled");
                }
                DebugMode::Disable => {
                    crate::log::disable_debug();
                    self.print("debug logging disabled");
                }
            },
            ConsoleCommand::Stepi => {
                let reason = self.target_mut()?.step()?;
                self.on_stop(reason);
            }
            ConsoleCommand::Continue => {
                let reason = self.target_mut()?.cont()?;
                self.on_stop(reason);
            }
            ConsoleCommand::Help => self.print(HELP),
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn target_mut(&mut self) -> anyhow::Result<&mut Target> {
        self.target
            .as_mut()
            .context("no debuggee, run `stopcast host` with a program or --pid")
    }

    fn status(&mut self) {
        let server = if self.server.is_running() {
            format!("running on {}", self.server.socket_path().display())
        } else {
            "stopped".to_string()
        };
        self.print(format!("server: {}", StatusView::from(server)));

        let debuggee = match self.target {
            Some(ref target) => format!("{} ({})", target.program(), target.pid()),
            None => "none".to_string(),
        };
        self.print(format!("debuggee: {debuggee}"));

        let clients = self.server.client_summary();
        self.print(format!("{} client(s) connected", clients.len()));
        for line in clients {
            self.print(format!("  {line}"));
        }
    }

    /// Stop-hook: snapshot the stopped debuggee and push updates to the clients.
    fn on_stop(&mut self, reason: StopReason) {
        match reason {
            StopReason::Stopped(sig) => {
                if let Some(ref target) = self.target {
                    weak_error!(self.adapter.capture(target), "capture registers:");
                }
                match self.adapter.pc() {
                    Ok(pc) => self.print(format!(
                        "debuggee stopped ({sig}) at {}",
                        AddressView::from(format!("{pc:#018x}"))
                    )),
                    Err(_) => self.print(format!("debuggee stopped ({sig})")),
                }

                if self.server.is_running() {
                    let stats = self.server.update_clients();
                    debug!("stop-hook: {stats:?}");
                }
            }
            StopReason::Exited(code) => {
                self.print(format!("debuggee exited with code {code}"));
                self.forget_target();
            }
            StopReason::Signaled(sig) => {
                self.print(format!("debuggee killed by {sig}"));
                self.forget_target();
            }
        }
    }

    fn forget_target(&mut self) {
        self.adapter.clear_target();
        self.target = None;
    }
}

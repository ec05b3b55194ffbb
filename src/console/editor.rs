use crate::console::command::COMMAND_NAMES;
use crossterm::style::Stylize;
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::HistoryHinter;
use rustyline::history::FileHistory;
use rustyline::{CompletionType, Config, Context, Editor};
use rustyline_derive::{Helper, Hinter, Validator};
use std::borrow::Cow;
use std::borrow::Cow::{Borrowed, Owned};

pub struct CommandCompleter {
    commands: Vec<&'static str>,
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        if line.starts_with("debug ") {
            let arg = line["debug ".len()..].trim_start();
            let pos = line.len() - arg.len();
            let pairs = ["enable", "disable"]
                .into_iter()
                .filter(|mode| mode.starts_with(arg))
                .map(|mode| Pair {
                    display: mode.to_string(),
                    replacement: mode.to_string(),
                })
                .collect();
            return Ok((pos, pairs));
        }

        let pairs = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(line))
            .map(|cmd| Pair {
                display: cmd.bold().to_string(),
                replacement: cmd.to_string(),
            })
            .collect();
        Ok((0, pairs))
    }
}

#[derive(Helper, Hinter, Validator)]
pub struct RLHelper {
    completer: CommandCompleter,
    #[rustyline(Hinter)]
    hinter: HistoryHinter,
    colored_prompt: String,
}

impl Completer for RLHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        self.completer.complete(line, pos, ctx)
    }
}

impl Highlighter for RLHelper {
    fn highlight_prompt<'b, 's: 'b, 'p: 'b>(
        &'s self,
        prompt: &'p str,
        default: bool,
    ) -> Cow<'b, str> {
        if default {
            Borrowed(&self.colored_prompt)
        } else {
            Borrowed(prompt)
        }
    }

    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Owned("\x1b[1m".to_owned() + hint + "\x1b[m")
    }
}

pub type ConsoleEditor = Editor<RLHelper, FileHistory>;

pub fn create_editor(prompt: &str) -> anyhow::Result<ConsoleEditor> {
    let config = Config::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .completion_type(CompletionType::List)
        .build();

    let h = RLHelper {
        completer: CommandCompleter {
            commands: COMMAND_NAMES.to_vec(),
        },
        hinter: HistoryHinter {},
        colored_prompt: format!("{}", prompt.green()),
    };

    let mut editor = Editor::with_config(config)?;
    editor.set_helper(Some(h));

    Ok(editor)
}

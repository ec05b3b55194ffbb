//! Plain-text rendering of update payloads, used by the bundled passive client.

use crate::adapter::Arch;
use crate::client::ConnectionStatus;
use crate::proto::{Message, RegisterValue, UpdateData};
use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::{Print, Stylize};
use crossterm::terminal::{Clear, ClearType};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write};

pub mod style {
    use crossterm::style::{Color, Stylize};
    use std::fmt::{Display, Formatter};
    use std::sync::atomic::{AtomicBool, Ordering};

    static COLORS: AtomicBool = AtomicBool::new(false);

    /// Colorize views from now on, used when the output is a terminal.
    pub fn enable_colors() {
        COLORS.store(true, Ordering::Relaxed)
    }

    pub(super) fn colors_enabled() -> bool {
        COLORS.load(Ordering::Relaxed)
    }

    struct View<T: Display> {
        inner: T,
        color: Color,
    }

    impl<T: Display> Display for View<T> {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            if colors_enabled() {
                write!(f, "{}", self.inner.to_string().with(self.color))
            } else {
                write!(f, "{}", self.inner)
            }
        }
    }

    macro_rules! view_struct {
        ($name: ident, $color: expr) => {
            pub struct $name<T: Display>(View<T>);

            impl<T: Display> From<T> for $name<T> {
                fn from(value: T) -> Self {
                    Self(View {
                        inner: value,
                        color: $color,
                    })
                }
            }

            impl<T: Display> Display for $name<T> {
                fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                    self.0.fmt(f)
                }
            }
        };
    }

    view_struct!(AddressView, Color::Blue);
    view_struct!(RegisterView, Color::Magenta);
    view_struct!(AsmInstructionView, Color::DarkRed);
    view_struct!(StatusView, Color::Yellow);
    view_struct!(ErrorView, Color::Red);
}

use style::{AddressView, AsmInstructionView, ErrorView, RegisterView, StatusView};

const HEXDUMP_WIDTH: usize = 16;

/// Classic hex dump: address, bytes and their printable characters.
pub fn hexdump(base: u64, data: &[u8]) -> String {
    data.chunks(HEXDUMP_WIDTH)
        .enumerate()
        .map(|(row, chunk)| {
            let addr = base.wrapping_add((row * HEXDUMP_WIDTH) as u64);
            let hex = chunk.iter().map(|b| format!("{b:02x}")).join(" ");
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            format!(
                "{}: {hex:<width$} |{ascii}|",
                AddressView::from(format!("{addr:#018x}")),
                width = HEXDUMP_WIDTH * 3 - 1
            )
        })
        .join("\n")
}

fn render_registers(
    arch: Option<Arch>,
    regs: &BTreeMap<String, RegisterValue>,
    next_instruction: Option<&str>,
) -> String {
    // pc and sp first, then the rest in name order
    let pinned = arch
        .map(|arch| vec![arch.pc_register(), arch.sp_register()])
        .unwrap_or_default();
    let ordered = pinned
        .iter()
        .filter_map(|name| regs.get_key_value(*name))
        .chain(
            regs.iter()
                .filter(|(name, _)| !pinned.contains(&name.as_str())),
        );

    let mut out = ordered
        .map(|(name, value)| {
            let value = match value {
                RegisterValue::Int(v) => AddressView::from(format!("{v:#018x}")).to_string(),
                RegisterValue::Text(text) => text.clone(),
            };
            format!("{} {value}", RegisterView::from(format!("{name:<8}")))
        })
        .join("\n");

    if let Some(instruction) = next_instruction {
        _ = write!(out, "\n\n=> {}", AsmInstructionView::from(instruction));
    }
    out
}

/// Stack as pointer-sized words, offsets relative to the stack pointer.
fn render_stack(arch: Option<Arch>, data: &[u8], sp: u64) -> String {
    let word_size = arch.map(Arch::pointer_size).unwrap_or(8);
    data.chunks(word_size)
        .enumerate()
        .map(|(i, word)| {
            let offset = i * word_size;
            let mut bytes = [0u8; 8];
            bytes[..word.len()].copy_from_slice(word);
            let value = u64::from_le_bytes(bytes);
            format!(
                "{} sp+{offset:#05x}: {value:#0width$x}",
                AddressView::from(format!("{:#018x}", sp.wrapping_add(offset as u64))),
                width = word_size * 2 + 2
            )
        })
        .join("\n")
}

/// Render an update payload. `arch` is the architecture tag of the update, if any.
pub fn render_update(arch: Option<Arch>, data: &UpdateData) -> String {
    match data {
        UpdateData::Registers {
            regs,
            next_instruction,
        } => render_registers(arch, regs, next_instruction.as_deref()),
        UpdateData::Stack { data, sp } => render_stack(arch, data, *sp),
        UpdateData::Disasm { disassembly } => disassembly
            .lines()
            .enumerate()
            .map(|(i, line)| {
                if i == 0 {
                    format!("=> {}", AsmInstructionView::from(line))
                } else {
                    format!("   {line}")
                }
            })
            .join("\n"),
        UpdateData::Backtrace { backtrace } => backtrace.clone(),
        UpdateData::Command { output } => output.clone(),
        UpdateData::Stopped { pc } => {
            format!("stopped at {}", AddressView::from(format!("{pc:#018x}")))
        }
        UpdateData::Raw(value) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
    }
}

/// Full-screen terminal output of a passive client.
pub struct Screen<W: Write> {
    out: W,
    title: String,
}

impl<W: Write> Screen<W> {
    pub fn new(out: W, title: impl Into<String>) -> Self {
        Self {
            out,
            title: title.into(),
        }
    }

    fn title(&self) -> String {
        if style::colors_enabled() {
            self.title.as_str().bold().to_string()
        } else {
            self.title.clone()
        }
    }

    fn redraw(&mut self, header: String, body: &str) -> io::Result<()> {
        if style::colors_enabled() {
            queue!(self.out, Clear(ClearType::All), MoveTo(0, 0))?;
        }
        queue!(self.out, Print(header), Print("\n"))?;
        for line in body.lines() {
            queue!(self.out, Print(line), Print("\n"))?;
        }
        self.out.flush()
    }

    /// Show a connection state, the previous content is replaced.
    pub fn status(&mut self, status: &ConnectionStatus) -> io::Result<()> {
        let line = match status {
            ConnectionStatus::Connected => StatusView::from(status).to_string(),
            _ => ErrorView::from(format!("[{status}]")).to_string(),
        };
        let header = format!("{} {line}", self.title());
        self.redraw(header, "")
    }

    /// Show a received message.
    pub fn message(&mut self, message: &Message) -> io::Result<()> {
        match message {
            Message::Update { arch, data } => {
                let arch = arch.as_deref().and_then(|tag| Arch::lookup(tag).ok());
                let header = match arch {
                    Some(arch) => format!("{} [{arch}]", self.title()),
                    None => self.title(),
                };
                self.redraw(header, &render_update(arch, data))
            }
            other => {
                log::debug!("`{}` message not rendered", other.name());
                Ok(())
            }
        }
    }
}

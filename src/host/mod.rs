//! Host integration: a ptrace debuggee and the adapter that exposes it to the server.
//!
//! Registers can only be read by the tracer thread, so the console captures them at every stop
//! ([`ProcessAdapter::capture`]) and the adapter answers from that snapshot. Memory is read
//! with `process_vm_readv`, which is allowed from any thread of the tracer.

mod register;
pub mod target;

pub use register::{Register, RegisterMap};

use crate::adapter::{
    AdapterError, DebuggerAdapter, RegisterSet, MAX_DISASM_INSTRUCTIONS, MAX_MEMORY_READ,
};
use crate::host::target::Target;
use crate::proto::RegisterValue;
use crate::view::hexdump;
use capstone::prelude::*;
use itertools::Itertools;
use nix::sys::uio::{self, RemoteIoVec};
use nix::unistd::Pid;
use proc_maps::MapRange;
use std::io::IoSliceMut;
use std::sync::{PoisonError, RwLock};

/// Longest x86 instruction.
const MAX_INSTRUCTION_LEN: usize = 15;
/// Maximum number of frames in a backtrace.
const MAX_FRAMES: usize = 64;
/// Default length of the `x` command.
const DEFAULT_EXAMINE_LEN: usize = 64;
const PAGE_SIZE: usize = 4096;

/// Architecture of the traced process, the register map is x86-64 only.
const TARGET_ARCH: &str = "x86_64";

#[derive(Clone, Copy)]
struct Snapshot {
    pid: Pid,
    regs: RegisterMap,
}

/// [`DebuggerAdapter`] over a ptrace-controlled process.
#[derive(Default)]
pub struct ProcessAdapter {
    snapshot: RwLock<Option<Snapshot>>,
}

impl ProcessAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a register snapshot of the stopped target. Must be called from the tracer thread.
    pub fn capture(&self, target: &Target) -> Result<(), AdapterError> {
        let pid = target.pid();
        let regs = RegisterMap::current(pid).map_err(|e| anyhow::anyhow!("read registers: {e}"))?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Snapshot { pid, regs });
        Ok(())
    }

    /// Forget the target, from now on the adapter has nothing to report.
    pub fn clear_target(&self) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn snapshot(&self) -> Result<Snapshot, AdapterError> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or(AdapterError::NoTarget)
    }

    fn disassemble(&self, count: usize) -> Result<Vec<String>, AdapterError> {
        let snapshot = self.snapshot()?;
        let pc = snapshot.regs.value(Register::Rip);
        let code = read_memory(snapshot.pid, pc, count * MAX_INSTRUCTION_LEN).map_err(|source| {
            AdapterError::Memory {
                addr: pc,
                len: count * MAX_INSTRUCTION_LEN,
                source,
            }
        })?;

        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Att)
            .build()
            .map_err(|e| AdapterError::Disasm(e.to_string()))?;
        let insns = cs
            .disasm_count(&code, pc, count)
            .map_err(|e| AdapterError::Disasm(e.to_string()))?;

        Ok(insns
            .iter()
            .map(|insn| {
                let mnemonic = insn.mnemonic().unwrap_or("???");
                match insn.op_str() {
                    Some(ops) if !ops.is_empty() => {
                        format!("{:#018x}: {mnemonic} {ops}", insn.address())
                    }
                    _ => format!("{:#018x}: {mnemonic}", insn.address()),
                }
            })
            .collect())
    }

    /// Return addresses of the frames, innermost first, found by following saved frame pointers.
    fn frames(&self) -> Result<Vec<u64>, AdapterError> {
        let snapshot = self.snapshot()?;
        let mut frames = vec![snapshot.regs.value(Register::Rip)];
        let mut fp = snapshot.regs.value(Register::Rbp);

        while frames.len() < MAX_FRAMES && fp != 0 {
            let Ok(record) = read_memory(snapshot.pid, fp, 16) else {
                break;
            };
            let Some((saved_fp, ret_addr)) = record
                .chunks_exact(8)
                .map(|word| u64::from_ne_bytes(word.try_into().unwrap_or_default()))
                .collect_tuple()
            else {
                break;
            };
            if ret_addr == 0 {
                break;
            }
            frames.push(ret_addr);
            // the stack grows down, an outer frame is always higher
            if saved_fp <= fp {
                break;
            }
            fp = saved_fp;
        }
        Ok(frames)
    }

    fn examine(&self, args: &[&str]) -> Result<String, AdapterError> {
        let usage = || AdapterError::UnsupportedCommand("usage: x ADDR [LEN]".to_string());
        let addr = args
            .first()
            .and_then(|arg| parse_number(arg))
            .ok_or_else(usage)?;
        let len = match args.get(1) {
            Some(arg) => parse_number(arg).ok_or_else(usage)? as usize,
            None => DEFAULT_EXAMINE_LEN,
        };
        let data = self.memory(addr, len.min(MAX_MEMORY_READ))?;
        Ok(hexdump(addr, &data))
    }
}

impl DebuggerAdapter for ProcessAdapter {
    fn has_target(&self) -> bool {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn arch(&self) -> Result<String, AdapterError> {
        self.snapshot()?;
        Ok(TARGET_ARCH.to_string())
    }

    fn registers(&self) -> Result<RegisterSet, AdapterError> {
        Ok(self.snapshot()?.regs.to_named())
    }

    fn register(&self, name: &str) -> Result<RegisterValue, AdapterError> {
        self.snapshot()?
            .regs
            .value_by_name(name)
            .map(RegisterValue::Int)
            .ok_or_else(|| AdapterError::RegisterNotFound(name.to_string()))
    }

    fn pc(&self) -> Result<u64, AdapterError> {
        Ok(self.snapshot()?.regs.value(Register::Rip))
    }

    fn sp(&self) -> Result<u64, AdapterError> {
        Ok(self.snapshot()?.regs.value(Register::Rsp))
    }

    fn next_instruction(&self) -> Result<String, AdapterError> {
        self.disassemble(1)?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Disasm("no instruction at pc".to_string()))
    }

    fn disasm(&self) -> Result<String, AdapterError> {
        Ok(self.disassemble(MAX_DISASM_INSTRUCTIONS)?.join("\n"))
    }

    fn memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, AdapterError> {
        let snapshot = self.snapshot()?;
        read_memory(snapshot.pid, addr, len).map_err(|source| AdapterError::Memory {
            addr,
            len,
            source,
        })
    }

    fn backtrace(&self) -> Result<String, AdapterError> {
        let snapshot = self.snapshot()?;
        let frames = self.frames()?;
        let maps = crate::weak_error!(proc_maps::get_process_maps(snapshot.pid.as_raw()))
            .unwrap_or_default();

        Ok(frames
            .iter()
            .enumerate()
            .map(|(num, addr)| match locate(&maps, *addr) {
                Some(location) => format!("#{num} {addr:#018x} in {location}"),
                None => format!("#{num} {addr:#018x}"),
            })
            .join("\n"))
    }

    fn cmd_output(&self, command: &str) -> Result<String, AdapterError> {
        let words = command.split_whitespace().collect_vec();
        match words.as_slice() {
            ["regs"] => Ok(self
                .registers()?
                .into_iter()
                .map(|(name, value)| match value {
                    RegisterValue::Int(v) => format!("{name:<8} {v:#018x}"),
                    RegisterValue::Text(text) => format!("{name:<8} {text}"),
                })
                .join("\n")),
            ["bt"] => self.backtrace(),
            ["disasm"] => self.disasm(),
            ["x", args @ ..] => self.examine(args),
            _ => Err(AdapterError::UnsupportedCommand(command.to_string())),
        }
    }
}

/// Read debuggee memory. The remote range is split by pages, so a read that runs into an
/// unmapped page returns the readable prefix.
fn read_memory(pid: Pid, addr: u64, len: usize) -> nix::Result<Vec<u8>> {
    if len == 0 {
        return Ok(vec![]);
    }

    let mut buf = vec![0u8; len];
    let remote = page_chunks(addr as usize, len);
    let read = uio::process_vm_readv(pid, &mut [IoSliceMut::new(&mut buf)], &remote)?;
    if read == 0 {
        return Err(nix::Error::EFAULT);
    }
    buf.truncate(read);
    Ok(buf)
}

fn page_chunks(start: usize, len: usize) -> Vec<RemoteIoVec> {
    let end = start.saturating_add(len);
    let mut chunks = vec![];
    let mut base = start;
    while base < end {
        let page_end = (base | (PAGE_SIZE - 1)).saturating_add(1);
        let chunk_end = page_end.min(end);
        chunks.push(RemoteIoVec {
            base,
            len: chunk_end - base,
        });
        base = chunk_end;
    }
    chunks
}

/// Mapped file and file offset of an address, like `/usr/lib/libc.so.6+0x2a1ca`.
fn locate(maps: &[MapRange], addr: u64) -> Option<String> {
    let addr = addr as usize;
    let map = maps
        .iter()
        .find(|map| map.start() <= addr && addr < map.start() + map.size())?;
    let file = map.filename()?;
    Some(format!(
        "{}+{:#x}",
        file.display(),
        addr - map.start() + map.offset
    ))
}

/// Parse a hex (`0x` prefixed) or decimal number.
pub fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

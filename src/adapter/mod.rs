//! Debugger adapter boundary.
//!
//! An adapter answers point-in-time questions about the debuggee of the host debugger.
//! The server consumes it through [`DebuggerAdapter`] and never caches its answers between
//! dispatch cycles.

mod arch;

pub use arch::Arch;

use crate::proto::RegisterValue;
use std::collections::BTreeMap;

/// Maximum number of instructions in a disassembly view.
pub const MAX_DISASM_INSTRUCTIONS: usize = 32;
/// Maximum number of bytes in a stack view.
pub const MAX_STACK_BYTES: usize = 512;
/// Maximum number of bytes returned by an interactive memory query.
pub const MAX_MEMORY_READ: usize = 1024 * 1024;

pub type RegisterSet = BTreeMap<String, RegisterValue>;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("no debuggee target")]
    NoTarget,
    #[error("unsupported architecture `{0}`")]
    UnsupportedArch(String),
    #[error("unknown register {0:?}")]
    RegisterNotFound(String),
    #[error("read {len} bytes at {addr:#x}: {source}")]
    Memory {
        addr: u64,
        len: usize,
        source: nix::Error,
    },
    #[error("disassembly: {0}")]
    Disasm(String),
    #[error("unsupported command `{0}`")]
    UnsupportedCommand(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Point-in-time view of the debuggee, for the currently selected thread and frame.
pub trait DebuggerAdapter: Send + Sync {
    /// True if there is a live debuggee to inspect.
    fn has_target(&self) -> bool;

    /// Architecture tag of the target, like `x86`, `x64`, `arm` or `arm64`.
    fn arch(&self) -> Result<String, AdapterError>;

    fn registers(&self) -> Result<RegisterSet, AdapterError>;

    fn register(&self, name: &str) -> Result<RegisterValue, AdapterError>;

    /// Program counter value.
    fn pc(&self) -> Result<u64, AdapterError>;

    /// Stack pointer value.
    fn sp(&self) -> Result<u64, AdapterError>;

    fn next_instruction(&self) -> Result<String, AdapterError>;

    /// Disassembly starting at the program counter, at most [`MAX_DISASM_INSTRUCTIONS`] long.
    fn disasm(&self) -> Result<String, AdapterError>;

    /// Memory starting at the stack pointer, at most [`MAX_STACK_BYTES`] long.
    fn stack(&self) -> Result<Vec<u8>, AdapterError> {
        let sp = self.sp()?;
        self.memory(sp, MAX_STACK_BYTES)
    }

    fn memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, AdapterError>;

    fn backtrace(&self) -> Result<String, AdapterError>;

    /// Output of a debugger-native command.
    fn cmd_output(&self, command: &str) -> Result<String, AdapterError>;
}

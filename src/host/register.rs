use crate::proto::RegisterValue;
use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// General purpose x86-64 registers, as exposed by `PTRACE_GETREGS`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    #[strum(to_string = "rsp", serialize = "sp")]
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    #[strum(to_string = "rip", serialize = "pc")]
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

/// Register values of a stopped thread.
#[derive(Clone, Copy)]
pub struct RegisterMap(user_regs_struct);

impl From<user_regs_struct> for RegisterMap {
    fn from(value: user_regs_struct) -> Self {
        Self(value)
    }
}

impl RegisterMap {
    /// Read registers of a stopped tracee. Must be called from the tracer thread.
    pub fn current(pid: Pid) -> nix::Result<Self> {
        let regs = sys::ptrace::getregs(pid)?;
        Ok(regs.into())
    }

    pub fn value(&self, register: Register) -> u64 {
        match register {
            Register::Rax => self.0.rax,
            Register::Rbx => self.0.rbx,
            Register::Rcx => self.0.rcx,
            Register::Rdx => self.0.rdx,
            Register::Rdi => self.0.rdi,
            Register::Rsi => self.0.rsi,
            Register::Rbp => self.0.rbp,
            Register::Rsp => self.0.rsp,
            Register::R8 => self.0.r8,
            Register::R9 => self.0.r9,
            Register::R10 => self.0.r10,
            Register::R11 => self.0.r11,
            Register::R12 => self.0.r12,
            Register::R13 => self.0.r13,
            Register::R14 => self.0.r14,
            Register::R15 => self.0.r15,
            Register::Rip => self.0.rip,
            Register::Eflags => self.0.eflags,
            Register::Cs => self.0.cs,
            Register::OrigRax => self.0.orig_rax,
            Register::FsBase => self.0.fs_base,
            Register::GsBase => self.0.gs_base,
            Register::Fs => self.0.fs,
            Register::Gs => self.0.gs,
            Register::Ss => self.0.ss,
            Register::Ds => self.0.ds,
            Register::Es => self.0.es,
        }
    }

    /// Value of a register by its name, `pc` and `sp` are accepted as aliases.
    pub fn value_by_name(&self, name: &str) -> Option<u64> {
        Register::from_str(name).ok().map(|r| self.value(r))
    }

    /// All registers keyed by name.
    pub fn to_named(&self) -> BTreeMap<String, RegisterValue> {
        Register::iter()
            .map(|r| (r.to_string(), RegisterValue::Int(self.value(r))))
            .collect()
    }
}

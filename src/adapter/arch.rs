use crate::adapter::AdapterError;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Architecture helper: per-architecture facts the views need to interpret raw data.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display)]
pub enum Arch {
    #[strum(to_string = "x86", serialize = "i386", serialize = "i686")]
    X86,
    #[strum(to_string = "x64", serialize = "x86_64", serialize = "amd64")]
    X64,
    #[strum(to_string = "arm", serialize = "armv7")]
    Arm,
    #[strum(to_string = "arm64", serialize = "aarch64")]
    Arm64,
}

impl Arch {
    /// Find a helper for an architecture tag reported by a debugger.
    pub fn lookup(tag: &str) -> Result<Self, AdapterError> {
        Arch::from_str(tag).map_err(|_| AdapterError::UnsupportedArch(tag.to_string()))
    }

    pub fn pointer_size(self) -> usize {
        match self {
            Arch::X86 | Arch::Arm => 4,
            Arch::X64 | Arch::Arm64 => 8,
        }
    }

    pub fn pc_register(self) -> &'static str {
        match self {
            Arch::X86 => "eip",
            Arch::X64 => "rip",
            Arch::Arm | Arch::Arm64 => "pc",
        }
    }

    pub fn sp_register(self) -> &'static str {
        match self {
            Arch::X86 => "esp",
            Arch::X64 => "rsp",
            Arch::Arm | Arch::Arm64 => "sp",
        }
    }
}

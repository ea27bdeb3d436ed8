//! x86_64 general purpose register table.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Declared in `user_regs_struct` order; the discriminant indexes [`REGISTERS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    R15,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    OrigRax,
    Rip,
    Cs,
    Eflags,
    Rsp,
    Ss,
    FsBase,
    GsBase,
    Ds,
    Es,
    Fs,
    Gs,
}

/// Name and DWARF register number (`-1` when DWARF has none) of a register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDescriptor {
    pub reg: Register,
    pub dwarf: i32,
    pub name: &'static str,
}

/// Every register, in `user_regs_struct` order.
pub const REGISTERS: [RegisterDescriptor; 27] = [
    RegisterDescriptor { reg: Register::R15, dwarf: 15, name: "r15" },
    RegisterDescriptor { reg: Register::R14, dwarf: 14, name: "r14" },
    RegisterDescriptor { reg: Register::R13, dwarf: 13, name: "r13" },
    RegisterDescriptor { reg: Register::R12, dwarf: 12, name: "r12" },
    RegisterDescriptor { reg: Register::Rbp, dwarf: 6, name: "rbp" },
    RegisterDescriptor { reg: Register::Rbx, dwarf: 3, name: "rbx" },
    RegisterDescriptor { reg: Register::R11, dwarf: 11, name: "r11" },
    RegisterDescriptor { reg: Register::R10, dwarf: 10, name: "r10" },
    RegisterDescriptor { reg: Register::R9, dwarf: 9, name: "r9" },
    RegisterDescriptor { reg: Register::R8, dwarf: 8, name: "r8" },
    RegisterDescriptor { reg: Register::Rax, dwarf: 0, name: "rax" },
    RegisterDescriptor { reg: Register::Rcx, dwarf: 2, name: "rcx" },
    RegisterDescriptor { reg: Register::Rdx, dwarf: 1, name: "rdx" },
    RegisterDescriptor { reg: Register::Rsi, dwarf: 4, name: "rsi" },
    RegisterDescriptor { reg: Register::Rdi, dwarf: 5, name: "rdi" },
    RegisterDescriptor { reg: Register::OrigRax, dwarf: -1, name: "orig_rax" },
    RegisterDescriptor { reg: Register::Rip, dwarf: -1, name: "rip" },
    RegisterDescriptor { reg: Register::Cs, dwarf: 51, name: "cs" },
    RegisterDescriptor { reg: Register::Eflags, dwarf: 49, name: "eflags" },
    RegisterDescriptor { reg: Register::Rsp, dwarf: 7, name: "rsp" },
    RegisterDescriptor { reg: Register::Ss, dwarf: 52, name: "ss" },
    RegisterDescriptor { reg: Register::FsBase, dwarf: 58, name: "fs_base" },
    RegisterDescriptor { reg: Register::GsBase, dwarf: 59, name: "gs_base" },
    RegisterDescriptor { reg: Register::Ds, dwarf: 53, name: "ds" },
    RegisterDescriptor { reg: Register::Es, dwarf: 50, name: "es" },
    RegisterDescriptor { reg: Register::Fs, dwarf: 54, name: "fs" },
    RegisterDescriptor { reg: Register::Gs, dwarf: 55, name: "gs" },
];

impl Register {
    pub fn descriptor(self) -> &'static RegisterDescriptor {
        &REGISTERS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn from_dwarf(regnum: i32) -> Option<Self> {
        if regnum < 0 {
            return None;
        }
        REGISTERS.iter().find(|d| d.dwarf == regnum).map(|d| d.reg)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown register `{0}`")]
pub struct UnknownRegister(pub String);

impl FromStr for Register {
    type Err = UnknownRegister;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REGISTERS
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(s))
            .map(|d| d.reg)
            .ok_or_else(|| UnknownRegister(s.to_string()))
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) mod user {
    use nix::libc::user_regs_struct;

    use super::Register;

    pub(crate) fn get(regs: &user_regs_struct, reg: Register) -> u64 {
        match reg {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rdi => regs.rdi,
            Register::Rsi => regs.rsi,
            Register::Rbp => regs.rbp,
            Register::Rsp => regs.rsp,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::Rip => regs.rip,
            Register::Eflags => regs.eflags,
            Register::Cs => regs.cs,
            Register::OrigRax => regs.orig_rax,
            Register::FsBase => regs.fs_base,
            Register::GsBase => regs.gs_base,
            Register::Fs => regs.fs,
            Register::Gs => regs.gs,
            Register::Ss => regs.ss,
            Register::Ds => regs.ds,
            Register::Es => regs.es,
        }
    }

    pub(crate) fn set(regs: &mut user_regs_struct, reg: Register, value: u64) {
        let slot = match reg {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rdi => &mut regs.rdi,
            Register::Rsi => &mut regs.rsi,
            Register::Rbp => &mut regs.rbp,
            Register::Rsp => &mut regs.rsp,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rip => &mut regs.rip,
            Register::Eflags => &mut regs.eflags,
            Register::Cs => &mut regs.cs,
            Register::OrigRax => &mut regs.orig_rax,
            Register::FsBase => &mut regs.fs_base,
            Register::GsBase => &mut regs.gs_base,
            Register::Fs => &mut regs.fs,
            Register::Gs => &mut regs.gs,
            Register::Ss => &mut regs.ss,
            Register::Ds => &mut regs.ds,
            Register::Es => &mut regs.es,
        };
        *slot = value;
    }
}

//! REPL command parsing. Command words match on any prefix, so `c`, `cont` and
//! `continue` all resume the tracee.

use anyhow::{Context, Result, anyhow, bail};
use libtrapdb::registers::Register;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Continue,
    Step,
    /// Runtime address unless `static_addr` is set (`break *0x1139`).
    Break { addr: u64, static_addr: bool },
    Delete { addr: u64 },
    Breakpoints,
    RegisterDump,
    RegisterRead(Register),
    RegisterWrite(Register, u64),
    MemoryRead { addr: u64, words: usize },
    MemoryWrite { addr: u64, value: u64 },
    Maps,
    Pc,
    Quit,
}

fn is_prefix(s: &str, of: &str) -> bool {
    !s.is_empty() && of.starts_with(s)
}

pub fn parse_hex(s: &str) -> Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex value `{s}`"))
}

fn arg<'a>(args: &[&'a str], idx: usize, what: &str) -> Result<&'a str> {
    args.get(idx)
        .copied()
        .ok_or_else(|| anyhow!("missing {what}"))
}

pub fn parse(line: &str) -> Result<Command> {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = args.first() else {
        bail!("empty command");
    };

    // `maps` must be spelled out, otherwise `m...` is `memory`.
    let cmd = if command == "maps" {
        Command::Maps
    } else if is_prefix(command, "continue") {
        Command::Continue
    } else if is_prefix(command, "step") {
        Command::Step
    } else if is_prefix(command, "break") {
        let target = arg(&args, 1, "breakpoint address")?;
        match target.strip_prefix('*') {
            Some(addr) => Command::Break {
                addr: parse_hex(addr)?,
                static_addr: true,
            },
            None => Command::Break {
                addr: parse_hex(target)?,
                static_addr: false,
            },
        }
    } else if is_prefix(command, "delete") {
        Command::Delete {
            addr: parse_hex(arg(&args, 1, "breakpoint address")?)?,
        }
    } else if command == "breakpoints" || command == "info" {
        Command::Breakpoints
    } else if is_prefix(command, "register") {
        let sub = arg(&args, 1, "register subcommand")?;
        if is_prefix(sub, "dump") {
            Command::RegisterDump
        } else if is_prefix(sub, "read") {
            Command::RegisterRead(arg(&args, 2, "register name")?.parse()?)
        } else if is_prefix(sub, "write") {
            let reg = arg(&args, 2, "register name")?.parse()?;
            Command::RegisterWrite(reg, parse_hex(arg(&args, 3, "register value")?)?)
        } else {
            bail!("unknown register subcommand `{sub}`");
        }
    } else if is_prefix(command, "memory") {
        let sub = arg(&args, 1, "memory subcommand")?;
        let addr = parse_hex(arg(&args, 2, "memory address")?)?;
        if is_prefix(sub, "read") {
            let words = match args.get(3) {
                Some(n) => n
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| anyhow!("number of words must be positive"))?,
                None => 1,
            };
            Command::MemoryRead { addr, words }
        } else if is_prefix(sub, "write") {
            Command::MemoryWrite {
                addr,
                value: parse_hex(arg(&args, 3, "memory value")?)?,
            }
        } else {
            bail!("unknown memory subcommand `{sub}`");
        }
    } else if command == "pc" {
        Command::Pc
    } else if is_prefix(command, "quit") || command == "exit" {
        Command::Quit
    } else {
        bail!("unknown command `{command}`");
    };

    Ok(cmd)
}

//! Process management wrapping `ptrace` interactions.

use std::os::unix::process::CommandExt;
use std::process::Command;

use log::{debug, info, warn};
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::errors::{TrapdbError, TrapdbResult};
use crate::registers::{self, Register};
use crate::tracer::{SigInfo, Tracer};

/// How to start a tracee.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Run the child with `ADDR_NO_RANDOMIZE` so addresses repeat across runs.
    pub disable_aslr: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self { disable_aslr: true }
    }
}

/// Represents a traced process under the debugger's control.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    /// Launched children die with the debugger; attached processes are detached.
    kill_on_drop: bool,
    exited: bool,
}

impl ProcessHandle {
    /// Launch `program` stopped at its first instruction, traced by the calling thread.
    pub fn launch(program: &str, args: &[String], options: &LaunchOptions) -> TrapdbResult<Self> {
        let disable_aslr = options.disable_aslr;
        let mut command = Command::new(program);
        command.args(args);

        // SAFETY: the hook only issues the personality and ptrace syscalls, both
        // async-signal-safe, between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if disable_aslr {
                    let persona = personality::get()?;
                    personality::set(persona | Persona::ADDR_NO_RANDOMIZE)?;
                }
                ptrace::traceme()?;
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        info!("launched {program} as pid {pid} (aslr disabled: {disable_aslr})");

        Ok(Self {
            pid,
            kill_on_drop: true,
            exited: false,
        })
    }

    /// Attach to an existing PID using `ptrace`.
    pub fn attach(pid: i32) -> TrapdbResult<Self> {
        if pid <= 0 {
            return Err(TrapdbError::InvalidPid);
        }
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid).map_err(TrapdbError::ptrace("PTRACE_ATTACH"))?;
        info!("attached to pid {pid}");

        Ok(Self {
            pid,
            kill_on_drop: false,
            exited: false,
        })
    }

    fn regs(&self) -> TrapdbResult<nix::libc::user_regs_struct> {
        ptrace::getregs(self.pid).map_err(TrapdbError::ptrace("PTRACE_GETREGS"))
    }
}

impl Tracer for ProcessHandle {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_word(&mut self, addr: u64) -> TrapdbResult<u64> {
        let word = ptrace::read(self.pid, addr as ptrace::AddressType)
            .map_err(TrapdbError::ptrace("PTRACE_PEEKDATA"))?;
        Ok(word as u64)
    }

    fn write_word(&mut self, addr: u64, word: u64) -> TrapdbResult<()> {
        ptrace::write(self.pid, addr as ptrace::AddressType, word as nix::libc::c_long)
            .map_err(TrapdbError::ptrace("PTRACE_POKEDATA"))
    }

    fn read_register(&mut self, reg: Register) -> TrapdbResult<u64> {
        Ok(registers::user::get(&self.regs()?, reg))
    }

    fn write_register(&mut self, reg: Register, value: u64) -> TrapdbResult<()> {
        let mut regs = self.regs()?;
        registers::user::set(&mut regs, reg, value);
        ptrace::setregs(self.pid, regs).map_err(TrapdbError::ptrace("PTRACE_SETREGS"))
    }

    fn cont(&mut self) -> TrapdbResult<()> {
        debug!("PTRACE_CONT pid {}", self.pid);
        ptrace::cont(self.pid, None).map_err(TrapdbError::ptrace("PTRACE_CONT"))
    }

    fn step(&mut self) -> TrapdbResult<()> {
        debug!("PTRACE_SINGLESTEP pid {}", self.pid);
        ptrace::step(self.pid, None).map_err(TrapdbError::ptrace("PTRACE_SINGLESTEP"))
    }

    fn wait(&mut self) -> TrapdbResult<WaitStatus> {
        let status = waitpid(self.pid, None).map_err(TrapdbError::ptrace("waitpid"))?;
        if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
            self.exited = true;
        }
        debug!("pid {}: {status:?}", self.pid);
        Ok(status)
    }

    fn siginfo(&mut self) -> TrapdbResult<SigInfo> {
        let info =
            ptrace::getsiginfo(self.pid).map_err(TrapdbError::ptrace("PTRACE_GETSIGINFO"))?;
        Ok(SigInfo {
            signo: info.si_signo,
            code: info.si_code,
        })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        if self.kill_on_drop {
            match signal::kill(self.pid, Signal::SIGKILL) {
                Ok(()) => {
                    let _ = waitpid(self.pid, None);
                    debug!("pid {} killed", self.pid);
                }
                Err(e) => warn!("failed to kill pid {}: {e}", self.pid),
            }
        } else if let Err(e) = ptrace::detach(self.pid, None) {
            warn!("failed to detach from pid {}: {e}", self.pid);
        }
    }
}

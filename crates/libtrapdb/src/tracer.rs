//! The tracer binding: every request the core makes of the OS for a single tracee.
//!
//! [`crate::process::ProcessHandle`] implements this over `ptrace(2)`. Tests drive the
//! core with a scripted fake instead.

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::errors::TrapdbResult;
use crate::registers::Register;

/// `si_code` for a trap raised by the kernel on `int3`.
pub const SI_KERNEL: i32 = 0x80;
/// `si_code` for a process breakpoint trap.
pub const TRAP_BRKPT: i32 = 1;
/// `si_code` for a single-step trap.
pub const TRAP_TRACE: i32 = 2;

/// Encoding of the software breakpoint instruction (`int3`).
#[cfg(target_arch = "x86_64")]
pub const TRAP_INSTRUCTION: [u8; 1] = [0xcc];
#[cfg(not(target_arch = "x86_64"))]
compile_error!("trapdb only supports x86_64 tracees");

/// Bytes the program counter advances past a trap instruction.
pub const TRAP_INSTRUCTION_LEN: u64 = TRAP_INSTRUCTION.len() as u64;

/// The fields of `siginfo_t` the stop dispatcher looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
}

/// Requests against one traced process. All of them require the tracee to be stopped,
/// except [`Tracer::wait`] which blocks until it is.
pub trait Tracer {
    fn pid(&self) -> Pid;

    /// `PTRACE_PEEKDATA`
    fn read_word(&mut self, addr: u64) -> TrapdbResult<u64>;

    /// `PTRACE_POKEDATA`
    fn write_word(&mut self, addr: u64, word: u64) -> TrapdbResult<()>;

    fn read_register(&mut self, reg: Register) -> TrapdbResult<u64>;

    fn write_register(&mut self, reg: Register, value: u64) -> TrapdbResult<()>;

    /// Resumes the tracee until its next stop.
    fn cont(&mut self) -> TrapdbResult<()>;

    /// Resumes the tracee for exactly one instruction.
    fn step(&mut self) -> TrapdbResult<()>;

    /// Blocks until the tracee changes state.
    fn wait(&mut self) -> TrapdbResult<WaitStatus>;

    /// Signal information for the last stop.
    fn siginfo(&mut self) -> TrapdbResult<SigInfo>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory tracee: a sparse byte-addressed memory, a register file and a script of
    //! wait results played back in order.

    use std::collections::{HashMap, VecDeque};

    use nix::errno::Errno;
    use nix::sys::signal::Signal;
    use nix::sys::wait::WaitStatus;
    use nix::unistd::Pid;

    use super::{SI_KERNEL, SigInfo, TRAP_INSTRUCTION_LEN, TRAP_TRACE, Tracer};
    use crate::errors::{TrapdbError, TrapdbResult};
    use crate::registers::Register;

    pub(crate) const PID: i32 = 4242;

    /// What the next resume request makes the tracee do.
    #[derive(Debug, Clone)]
    pub(crate) enum Scripted {
        /// Executes up to and including the trap byte at the address.
        HitTrap(u64),
        /// Executes one instruction, landing at the address.
        StepTo(u64),
        Signal(Signal, i32, u64),
        TrapCode(i32, u64),
        Exit(i32),
        Kill(Signal),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Request {
        Cont,
        Step,
    }

    #[derive(Default)]
    pub(crate) struct FakeTracer {
        pub(crate) memory: HashMap<u64, u8>,
        pub(crate) registers: HashMap<Register, u64>,
        pub(crate) script: VecDeque<Scripted>,
        pub(crate) requests: Vec<Request>,
        /// Program counter and the byte under it each time the tracee resumed.
        pub(crate) executed: Vec<(u64, u8)>,
        pub(crate) fail_writes: bool,
        /// The tracee dies under the next resume request, which fails with `ESRCH`.
        pub(crate) vanish_on_resume: bool,
        /// Writes start failing once a single step has been issued.
        pub(crate) fail_writes_after_step: bool,
        pending: Option<WaitStatus>,
        last_siginfo: Option<SigInfo>,
        exited: bool,
    }

    impl FakeTracer {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_code(mut self, addr: u64, bytes: &[u8]) -> Self {
            for (i, b) in bytes.iter().enumerate() {
                self.memory.insert(addr + i as u64, *b);
            }
            self
        }

        pub(crate) fn with_pc(mut self, pc: u64) -> Self {
            self.registers.insert(Register::Rip, pc);
            self
        }

        /// The exec stop a freshly launched tracee reports.
        pub(crate) fn with_initial_stop(mut self) -> Self {
            self.pending = Some(WaitStatus::Stopped(self.pid_raw(), Signal::SIGTRAP));
            self.last_siginfo = Some(SigInfo {
                signo: Signal::SIGTRAP as i32,
                code: 0,
            });
            self
        }

        pub(crate) fn then(mut self, next: Scripted) -> Self {
            self.script.push_back(next);
            self
        }

        pub(crate) fn byte(&self, addr: u64) -> u8 {
            self.memory.get(&addr).copied().unwrap_or(0)
        }

        pub(crate) fn pc(&self) -> u64 {
            self.registers.get(&Register::Rip).copied().unwrap_or(0)
        }

        /// The tracee is killed from outside while stopped.
        pub(crate) fn vanish(&mut self) {
            self.exited = true;
        }

        fn pid_raw(&self) -> Pid {
            Pid::from_raw(PID)
        }

        fn check_alive(&self) -> TrapdbResult<()> {
            if self.exited {
                return Err(TrapdbError::ptrace("fake")(Errno::ESRCH));
            }
            Ok(())
        }

        fn resume(&mut self, request: Request) -> TrapdbResult<()> {
            self.check_alive()?;
            if self.vanish_on_resume {
                self.exited = true;
                return Err(TrapdbError::ptrace("fake")(Errno::ESRCH));
            }
            self.requests.push(request);
            if request == Request::Step && self.fail_writes_after_step {
                self.fail_writes = true;
            }
            let pc = self.pc();
            let byte = self.byte(pc);
            self.executed.push((pc, byte));

            let trap = Signal::SIGTRAP;
            let pid = self.pid_raw();
            let next = self.script.pop_front().unwrap_or(Scripted::Exit(0));
            let (status, info, new_pc) = match next {
                Scripted::HitTrap(addr) => {
                    assert_eq!(self.byte(addr), 0xcc, "no trap patched at {addr:#x}");
                    (
                        WaitStatus::Stopped(pid, trap),
                        SigInfo { signo: trap as i32, code: SI_KERNEL },
                        Some(addr + TRAP_INSTRUCTION_LEN),
                    )
                }
                Scripted::StepTo(addr) => (
                    WaitStatus::Stopped(pid, trap),
                    SigInfo { signo: trap as i32, code: TRAP_TRACE },
                    Some(addr),
                ),
                Scripted::Signal(sig, code, addr) => (
                    WaitStatus::Stopped(pid, sig),
                    SigInfo { signo: sig as i32, code },
                    Some(addr),
                ),
                Scripted::TrapCode(code, addr) => (
                    WaitStatus::Stopped(pid, trap),
                    SigInfo { signo: trap as i32, code },
                    Some(addr),
                ),
                Scripted::Exit(code) => (
                    WaitStatus::Exited(pid, code),
                    SigInfo { signo: 0, code: 0 },
                    None,
                ),
                Scripted::Kill(sig) => (
                    WaitStatus::Signaled(pid, sig, false),
                    SigInfo { signo: 0, code: 0 },
                    None,
                ),
            };
            if let Some(new_pc) = new_pc {
                self.registers.insert(Register::Rip, new_pc);
            }
            self.pending = Some(status);
            self.last_siginfo = Some(info);
            Ok(())
        }
    }

    impl Tracer for FakeTracer {
        fn pid(&self) -> Pid {
            self.pid_raw()
        }

        fn read_word(&mut self, addr: u64) -> TrapdbResult<u64> {
            self.check_alive()?;
            let mut bytes = [0u8; 8];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = self.byte(addr + i as u64);
            }
            Ok(u64::from_le_bytes(bytes))
        }

        fn write_word(&mut self, addr: u64, word: u64) -> TrapdbResult<()> {
            self.check_alive()?;
            if self.fail_writes {
                return Err(TrapdbError::ptrace("PTRACE_POKEDATA")(Errno::EIO));
            }
            for (i, b) in word.to_le_bytes().into_iter().enumerate() {
                self.memory.insert(addr + i as u64, b);
            }
            Ok(())
        }

        fn read_register(&mut self, reg: Register) -> TrapdbResult<u64> {
            self.check_alive()?;
            Ok(self.registers.get(&reg).copied().unwrap_or(0))
        }

        fn write_register(&mut self, reg: Register, value: u64) -> TrapdbResult<()> {
            self.check_alive()?;
            self.registers.insert(reg, value);
            Ok(())
        }

        fn cont(&mut self) -> TrapdbResult<()> {
            self.resume(Request::Cont)
        }

        fn step(&mut self) -> TrapdbResult<()> {
            self.resume(Request::Step)
        }

        fn wait(&mut self) -> TrapdbResult<WaitStatus> {
            let status = self
                .pending
                .take()
                .ok_or(TrapdbError::ptrace("waitpid")(Errno::ECHILD))?;
            if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                self.exited = true;
            }
            Ok(status)
        }

        fn siginfo(&mut self) -> TrapdbResult<SigInfo> {
            self.check_alive()?;
            self.last_siginfo
                .ok_or(TrapdbError::ptrace("PTRACE_GETSIGINFO")(Errno::EINVAL))
        }
    }
}

//! Stop dispatcher: blocks until the tracee changes state and says why.

use std::fmt;

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use crate::address::RuntimeAddr;
use crate::errors::{TrapdbError, TrapdbResult};
use crate::registers::Register;
use crate::tracer::{SI_KERNEL, TRAP_BRKPT, TRAP_INSTRUCTION_LEN, TRAP_TRACE, Tracer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Trapped on a patched `int3`; the pc has been moved back onto it.
    BreakpointHit,
    SingleStepTrap,
    /// Stopped by a signal other than `SIGTRAP`, faults included.
    Signaled { signal: Signal, code: i32 },
    Exited(i32),
    Terminated(Signal),
    /// `SIGTRAP` with a `si_code` we don't decode.
    Unknown(i32),
}

impl StopCause {
    /// The tracee no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopCause::Exited(_) | StopCause::Terminated(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            StopCause::Signaled {
                signal: Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGILL | Signal::SIGFPE,
                ..
            }
        )
    }

    pub fn description(&self) -> String {
        match self {
            StopCause::BreakpointHit => "breakpoint hit".to_string(),
            StopCause::SingleStepTrap => "single step".to_string(),
            StopCause::Signaled { signal, code } => {
                format!("{} ({signal}, code {code})", signal_description(*signal))
            }
            StopCause::Exited(status) => format!("exited with status {status}"),
            StopCause::Terminated(signal) => {
                format!("terminated by {} ({signal})", signal_description(*signal))
            }
            StopCause::Unknown(code) => format!("unknown SIGTRAP code {code}"),
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

fn signal_description(signal: Signal) -> &'static str {
    match signal {
        Signal::SIGSEGV => "Segmentation fault",
        Signal::SIGBUS => "Bus error",
        Signal::SIGILL => "Illegal instruction",
        Signal::SIGFPE => "Floating point exception",
        Signal::SIGABRT => "Aborted",
        Signal::SIGTRAP => "Trace/breakpoint trap",
        Signal::SIGINT => "Interrupt",
        Signal::SIGTERM => "Terminated",
        Signal::SIGKILL => "Killed",
        Signal::SIGSTOP => "Stopped (signal)",
        Signal::SIGTSTP => "Stopped",
        Signal::SIGCONT => "Continued",
        Signal::SIGCHLD => "Child exited",
        Signal::SIGPIPE => "Broken pipe",
        Signal::SIGALRM => "Alarm clock",
        Signal::SIGUSR1 => "User defined signal 1",
        Signal::SIGUSR2 => "User defined signal 2",
        other => other.as_str(),
    }
}

/// Result of one wait: why the tracee stopped and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent {
    pub cause: StopCause,
    /// `None` once the tracee is gone.
    pub pc: Option<RuntimeAddr>,
}

/// Blocks until the tracee stops, exits or is killed, and classifies the change.
///
/// On a breakpoint trap the pc reported by the kernel sits just past the `int3`; it is
/// rewound so that it names the breakpoint address itself.
pub fn wait_for_stop(tracer: &mut impl Tracer) -> TrapdbResult<StopEvent> {
    let status = tracer.wait()?;

    let event = match status {
        WaitStatus::Exited(_, code) => {
            info!("pid {} exited with status {code}", tracer.pid());
            StopEvent {
                cause: StopCause::Exited(code),
                pc: None,
            }
        }
        WaitStatus::Signaled(_, signal, _) => {
            info!("pid {} terminated by {signal}", tracer.pid());
            StopEvent {
                cause: StopCause::Terminated(signal),
                pc: None,
            }
        }
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {
            let info = tracer.siginfo()?;
            dispatch_trap(tracer, info.code)?
        }
        WaitStatus::Stopped(_, signal) => {
            let info = tracer.siginfo()?;
            let pc = RuntimeAddr(tracer.read_register(Register::Rip)?);
            debug!("pid {} got {signal} (code {}) at {pc}", tracer.pid(), info.code);
            StopEvent {
                cause: StopCause::Signaled {
                    signal,
                    code: info.code,
                },
                pc: Some(pc),
            }
        }
        other => return Err(TrapdbError::UnexpectedWaitStatus(format!("{other:?}"))),
    };

    Ok(event)
}

fn dispatch_trap(tracer: &mut impl Tracer, code: i32) -> TrapdbResult<StopEvent> {
    let pc = RuntimeAddr(tracer.read_register(Register::Rip)?);

    let event = match code {
        SI_KERNEL | TRAP_BRKPT => {
            let bp_addr = pc.rewind(TRAP_INSTRUCTION_LEN);
            tracer.write_register(Register::Rip, bp_addr.value())?;
            debug!("breakpoint trap at {bp_addr}");
            StopEvent {
                cause: StopCause::BreakpointHit,
                pc: Some(bp_addr),
            }
        }
        TRAP_TRACE => StopEvent {
            cause: StopCause::SingleStepTrap,
            pc: Some(pc),
        },
        code => {
            warn!("unknown SIGTRAP code {code} at {pc}");
            StopEvent {
                cause: StopCause::Unknown(code),
                pc: Some(pc),
            }
        }
    };

    Ok(event)
}

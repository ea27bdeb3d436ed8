//! Error taxonomy for the debugger core.

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

use crate::address::{RuntimeAddr, StaticAddr};

/// Unified result type across the debugger core.
pub type TrapdbResult<T> = Result<T, TrapdbError>;

/// Error cases
#[derive(Debug, Error)]
pub enum TrapdbError {
    #[error("invalid process ID")]
    InvalidPid,

    /// `enable()` was called on a breakpoint that already patched its address.
    #[error("breakpoint at {0} is already enabled")]
    BreakpointAlreadyEnabled(RuntimeAddr),

    /// An enabled breakpoint already occupies the address.
    #[error("a breakpoint already exists at {0}")]
    BreakpointExists(RuntimeAddr),

    /// The tracee has exited or was killed; its handle is no longer usable.
    #[error("the traced process is no longer running")]
    TraceeExited,

    /// No memory mapping could be read for the tracee.
    #[error("no memory mappings available for pid {0}")]
    MissingMappings(Pid),

    #[error("tracee did not reach its initial stop: {0}")]
    BootstrapFailed(String),

    /// A tracer request was rejected by the kernel.
    #[error("{op} failed: {source}")]
    Ptrace {
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error("unexpected wait status: {0}")]
    UnexpectedWaitStatus(String),

    /// No line entry covers the address.
    #[error("no source location for {0}")]
    NotFound(StaticAddr),

    #[error("symbol loading failed: {0}")]
    Symbols(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TrapdbError {
    /// Wraps an errno coming back from the named tracer request.
    pub(crate) fn ptrace(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| TrapdbError::Ptrace { op, source }
    }

    /// Whether the error means the tracee is gone (`ESRCH` from the kernel included).
    pub fn is_tracee_gone(&self) -> bool {
        matches!(
            self,
            TrapdbError::TraceeExited
                | TrapdbError::Ptrace {
                    source: Errno::ESRCH,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptrace_error_names_the_operation() {
        let err = TrapdbError::ptrace("PTRACE_PEEKDATA")(Errno::EPERM);
        let msg = err.to_string();
        assert!(msg.starts_with("PTRACE_PEEKDATA failed"));
        assert!(!err.is_tracee_gone());
    }

    #[test]
    fn esrch_counts_as_gone() {
        assert!(TrapdbError::ptrace("PTRACE_CONT")(Errno::ESRCH).is_tracee_gone());
        assert!(TrapdbError::TraceeExited.is_tracee_gone());
    }
}

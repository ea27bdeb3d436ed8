//! Core library facade for the trapdb debugger.
//! Provides the breakpoint and execution-control engine used by the CLI front end.

pub mod address;
pub mod breakpoint;
pub mod control;
pub mod errors;
pub mod maps;
pub mod process;
pub mod registers;
pub mod session;
pub mod stop;
pub mod symbols;
pub mod tracer;

pub use address::{ExecutableKind, LoadBias, RuntimeAddr, StaticAddr};
pub use breakpoint::{Breakpoint, BreakpointId, BreakpointStore};
pub use errors::{TrapdbError, TrapdbResult};
pub use session::{PendingSession, Session, StopReport};
pub use stop::{StopCause, StopEvent};

/// Exposes the crate version for CLI reporting.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

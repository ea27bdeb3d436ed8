//! Debugging session: one tracee, its breakpoints and its load bias.
//!
//! A tracee starts out as a [`PendingSession`]. Only [`PendingSession::bootstrap`], which
//! waits for the initial stop before reading the mapping table, can turn it into a
//! [`Session`], so the load bias is always computed against a populated address space.

use log::{debug, info, warn};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::address::{LoadBias, RuntimeAddr, StaticAddr};
use crate::breakpoint::{BreakpointId, BreakpointStore};
use crate::control::Controller;
use crate::errors::{TrapdbError, TrapdbResult};
use crate::maps::{Mapping, MappingSource, ProcMaps};
use crate::registers::{REGISTERS, Register};
use crate::stop::StopEvent;
use crate::symbols::{SourceLocation, SymbolResolver};
use crate::tracer::Tracer;

/// What the front end gets back from a resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub event: StopEvent,
    pub location: Option<SourceLocation>,
    pub function: Option<String>,
}

/// A traced process that has not reached its first stop yet.
pub struct PendingSession<T: Tracer, R: SymbolResolver, M: MappingSource = ProcMaps> {
    tracer: T,
    resolver: R,
    maps: M,
}

impl<T: Tracer, R: SymbolResolver, M: MappingSource> PendingSession<T, R, M> {
    pub fn new(tracer: T, resolver: R, maps: M) -> Self {
        Self {
            tracer,
            resolver,
            maps,
        }
    }

    /// Waits for the tracee's initial stop, then computes the load bias.
    pub fn bootstrap(mut self) -> TrapdbResult<Session<T, R, M>> {
        match self.tracer.wait()? {
            WaitStatus::Stopped(pid, signal) => debug!("pid {pid} initial stop: {signal}"),
            other => return Err(TrapdbError::BootstrapFailed(format!("{other:?}"))),
        }

        let bias = LoadBias::compute(
            self.resolver.executable_kind(),
            self.tracer.pid(),
            &self.maps,
        )?;
        info!(
            "session ready for pid {} (load bias {:#x})",
            self.tracer.pid(),
            bias.offset()
        );

        Ok(Session {
            controller: Controller::new(self.tracer),
            resolver: self.resolver,
            maps: self.maps,
            bias,
        })
    }
}

/// A stopped, bootstrapped tracee ready for breakpoint and execution commands.
pub struct Session<T: Tracer, R: SymbolResolver, M: MappingSource = ProcMaps> {
    controller: Controller<T>,
    resolver: R,
    maps: M,
    bias: LoadBias,
}

impl<T: Tracer, R: SymbolResolver, M: MappingSource> Session<T, R, M> {
    pub fn pid(&self) -> Pid {
        self.controller.tracer().pid()
    }

    pub fn is_alive(&self) -> bool {
        self.controller.is_alive()
    }

    pub fn bias(&self) -> LoadBias {
        self.bias
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn controller(&self) -> &Controller<T> {
        &self.controller
    }

    pub fn to_runtime(&self, addr: StaticAddr) -> RuntimeAddr {
        self.bias.to_runtime(addr)
    }

    pub fn to_static(&self, addr: RuntimeAddr) -> StaticAddr {
        self.bias.to_static(addr)
    }

    pub fn set_breakpoint(&mut self, addr: RuntimeAddr) -> TrapdbResult<BreakpointId> {
        let id = self.controller.set_breakpoint(addr)?;
        info!("breakpoint {id} at {addr}");
        Ok(id)
    }

    /// Sets a breakpoint at an address taken from the executable file.
    pub fn set_breakpoint_at_static(&mut self, addr: StaticAddr) -> TrapdbResult<BreakpointId> {
        self.set_breakpoint(self.to_runtime(addr))
    }

    pub fn remove_breakpoint(&mut self, addr: RuntimeAddr) -> TrapdbResult<()> {
        self.controller.remove_breakpoint(addr)
    }

    pub fn breakpoints(&self) -> &BreakpointStore {
        self.controller.breakpoints()
    }

    pub fn continue_execution(&mut self) -> TrapdbResult<StopReport> {
        let event = self.controller.continue_execution()?;
        Ok(self.report(event))
    }

    pub fn single_step(&mut self) -> TrapdbResult<StopReport> {
        let event = self.controller.single_step()?;
        Ok(self.report(event))
    }

    pub fn read_memory(&mut self, addr: RuntimeAddr) -> TrapdbResult<u64> {
        self.controller.read_memory(addr)
    }

    pub fn write_memory(&mut self, addr: RuntimeAddr, word: u64) -> TrapdbResult<()> {
        self.controller.write_memory(addr, word)
    }

    pub fn read_register(&mut self, reg: Register) -> TrapdbResult<u64> {
        self.controller.read_register(reg)
    }

    pub fn write_register(&mut self, reg: Register, value: u64) -> TrapdbResult<()> {
        self.controller.write_register(reg, value)
    }

    pub fn dump_registers(&mut self) -> TrapdbResult<Vec<(Register, u64)>> {
        REGISTERS
            .iter()
            .map(|d| self.controller.read_register(d.reg).map(|value| (d.reg, value)))
            .collect()
    }

    pub fn get_pc(&mut self) -> TrapdbResult<RuntimeAddr> {
        self.controller.get_pc()
    }

    pub fn set_pc(&mut self, pc: RuntimeAddr) -> TrapdbResult<()> {
        self.controller.set_pc(pc)
    }

    pub fn mappings(&self) -> TrapdbResult<Vec<Mapping>> {
        if !self.is_alive() {
            return Err(TrapdbError::TraceeExited);
        }
        self.maps.mappings(self.pid())
    }

    /// Source line for a runtime address.
    pub fn location_of(&self, addr: RuntimeAddr) -> TrapdbResult<SourceLocation> {
        self.resolver.location(self.to_static(addr))
    }

    /// Adds source context to a stop. Lookup misses leave the fields empty.
    fn report(&self, event: StopEvent) -> StopReport {
        let Some(pc) = event.pc else {
            return StopReport {
                event,
                location: None,
                function: None,
            };
        };

        let static_pc = self.to_static(pc);
        let location = match self.resolver.location(static_pc) {
            Ok(location) => Some(location),
            Err(TrapdbError::NotFound(_)) => {
                debug!("no line entry for {static_pc}");
                None
            }
            Err(e) => {
                warn!("line lookup for {static_pc} failed: {e}");
                None
            }
        };

        StopReport {
            event,
            location,
            function: self.resolver.function_name(static_pc),
        }
    }
}

impl<T: Tracer, R: SymbolResolver, M: MappingSource> Drop for Session<T, R, M> {
    fn drop(&mut self) {
        if self.controller.is_alive() {
            if let Err(e) = self.controller.disable_all_breakpoints() {
                warn!("failed to restore breakpoints in pid {}: {e}", self.pid());
            }
        }
    }
}

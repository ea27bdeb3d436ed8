//! Execution controller: resumes the tracee and keeps breakpoints out of the way.

use log::{debug, warn};

use crate::address::RuntimeAddr;
use crate::breakpoint::{BreakpointId, BreakpointStore};
use crate::errors::{TrapdbError, TrapdbResult};
use crate::registers::Register;
use crate::stop::{self, StopCause, StopEvent};
use crate::tracer::Tracer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceeState {
    Stopped,
    Exited,
}

/// Owns the tracer and every breakpoint patched into the tracee.
pub struct Controller<T: Tracer> {
    tracer: T,
    breakpoints: BreakpointStore,
    state: TraceeState,
}

impl<T: Tracer> Controller<T> {
    /// Wraps a tracer whose tracee is currently stopped.
    pub fn new(tracer: T) -> Self {
        Self {
            tracer,
            breakpoints: BreakpointStore::new(),
            state: TraceeState::Stopped,
        }
    }

    pub fn state(&self) -> TraceeState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == TraceeState::Stopped
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn breakpoints(&self) -> &BreakpointStore {
        &self.breakpoints
    }

    fn ensure_alive(&self) -> TrapdbResult<()> {
        match self.state {
            TraceeState::Stopped => Ok(()),
            TraceeState::Exited => Err(TrapdbError::TraceeExited),
        }
    }

    /// Marks the tracee dead when a request failed because it is gone.
    fn track<R>(&mut self, result: TrapdbResult<R>) -> TrapdbResult<R> {
        if let Err(e) = &result {
            if e.is_tracee_gone() && self.is_alive() {
                warn!("tracee {} disappeared: {e}", self.tracer.pid());
                self.mark_exited();
            }
        }
        result
    }

    fn mark_exited(&mut self) {
        self.state = TraceeState::Exited;
        self.breakpoints.abandon_all();
    }

    /// Waits for the next stop and records whether the tracee survived it.
    fn wait(&mut self) -> TrapdbResult<StopEvent> {
        let event = stop::wait_for_stop(&mut self.tracer);
        let event = self.track(event)?;
        if event.cause.is_terminal() {
            self.mark_exited();
        }
        Ok(event)
    }

    pub fn get_pc(&mut self) -> TrapdbResult<RuntimeAddr> {
        self.read_register(Register::Rip).map(RuntimeAddr)
    }

    pub fn set_pc(&mut self, pc: RuntimeAddr) -> TrapdbResult<()> {
        self.write_register(Register::Rip, pc.value())
    }

    pub fn read_register(&mut self, reg: Register) -> TrapdbResult<u64> {
        self.ensure_alive()?;
        let value = self.tracer.read_register(reg);
        self.track(value)
    }

    pub fn write_register(&mut self, reg: Register, value: u64) -> TrapdbResult<()> {
        self.ensure_alive()?;
        let written = self.tracer.write_register(reg, value);
        self.track(written)
    }

    pub fn read_memory(&mut self, addr: RuntimeAddr) -> TrapdbResult<u64> {
        self.ensure_alive()?;
        let word = self.tracer.read_word(addr.value());
        self.track(word)
    }

    /// Writes a word of tracee memory. Breakpoints inside the word stay patched and
    /// restore the written bytes when disabled.
    pub fn write_memory(&mut self, addr: RuntimeAddr, word: u64) -> TrapdbResult<()> {
        self.ensure_alive()?;
        let written = self.breakpoints.write_through(&mut self.tracer, addr, word);
        self.track(written)
    }

    pub fn set_breakpoint(&mut self, addr: RuntimeAddr) -> TrapdbResult<BreakpointId> {
        self.ensure_alive()?;
        let id = self.breakpoints.insert(&mut self.tracer, addr);
        self.track(id)
    }

    pub fn remove_breakpoint(&mut self, addr: RuntimeAddr) -> TrapdbResult<()> {
        self.ensure_alive()?;
        let removed = self.breakpoints.remove(&mut self.tracer, addr);
        self.track(removed)
    }

    /// Restores every patched byte while the tracee is still around.
    pub fn disable_all_breakpoints(&mut self) -> TrapdbResult<()> {
        self.ensure_alive()?;
        let restored = self.breakpoints.disable_all(&mut self.tracer);
        self.track(restored)
    }

    /// Raw single step: one instruction, no breakpoint handling.
    pub fn step_instruction(&mut self) -> TrapdbResult<StopEvent> {
        self.ensure_alive()?;
        let stepped = self.tracer.step();
        self.track(stepped)?;
        self.wait()
    }

    /// Executes the real instruction under the breakpoint at `pc`.
    ///
    /// The breakpoint is disabled, the tracee stepped once and the breakpoint enabled
    /// again. If the tracee died during the step the patch is abandoned with it.
    fn step_over_breakpoint(&mut self, pc: RuntimeAddr) -> TrapdbResult<StopEvent> {
        debug!("stepping over breakpoint at {pc}");
        if let Some(bp) = self.breakpoints.get_mut(pc) {
            let disabled = bp.disable(&mut self.tracer);
            self.track(disabled)?;
        }

        let stepped = self.step_instruction();
        if !self.is_alive() {
            warn!("tracee exited while stepping over {pc}");
            return stepped;
        }

        if let Some(bp) = self.breakpoints.get_mut(pc) {
            if let Err(e) = bp.enable(&mut self.tracer) {
                warn!("breakpoint at {pc} not re-enabled after step ({stepped:?}): {e}");
                return self.track(Err(e));
            }
        }
        stepped
    }

    /// Runs the tracee until its next stop, stepping over a breakpoint at the pc first.
    ///
    /// The step over a breakpoint produces its own single-step stop; that event is
    /// consumed here. If the step ends any other way (exit, fault) that event is
    /// returned and the tracee is not resumed.
    pub fn continue_execution(&mut self) -> TrapdbResult<StopEvent> {
        self.ensure_alive()?;

        let pc = self.get_pc()?;
        if self.breakpoints.enabled_at(pc) {
            let stepped = self.step_over_breakpoint(pc)?;
            if stepped.cause != StopCause::SingleStepTrap {
                return Ok(stepped);
            }
        }

        let resumed = self.tracer.cont();
        self.track(resumed)?;
        self.wait()
    }

    /// Executes one instruction. A breakpoint at the pc is stepped over, never trapped on.
    pub fn single_step(&mut self) -> TrapdbResult<StopEvent> {
        self.ensure_alive()?;

        let pc = self.get_pc()?;
        if self.breakpoints.enabled_at(pc) {
            self.step_over_breakpoint(pc)
        } else {
            self.step_instruction()
        }
    }
}

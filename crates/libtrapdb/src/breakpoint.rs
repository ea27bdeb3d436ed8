//! Software breakpoints.
//!
//! A breakpoint patches the first byte of an instruction with `int3`. The original byte
//! lives only in the [`Breakpoint`] while it is enabled, so all patching goes through
//! here: [`BreakpointStore`] refuses a second patch of the same address, and nothing
//! else writes trap bytes.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use log::{debug, trace};

use crate::address::RuntimeAddr;
use crate::errors::{TrapdbError, TrapdbResult};
use crate::tracer::{TRAP_INSTRUCTION, Tracer};

const LOW_BYTE: u64 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Breakpoint {
    id: BreakpointId,
    addr: RuntimeAddr,
    /// Original instruction byte; present exactly while the trap is patched in.
    saved_byte: Option<u8>,
}

impl Breakpoint {
    /// Creates a disabled breakpoint; memory is untouched until [`Breakpoint::enable`].
    pub fn new(id: BreakpointId, addr: RuntimeAddr) -> Self {
        Self {
            id,
            addr,
            saved_byte: None,
        }
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn address(&self) -> RuntimeAddr {
        self.addr
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.saved_byte.is_some()
    }

    pub fn saved_byte(&self) -> Option<u8> {
        self.saved_byte
    }

    /// Patches the trap instruction over the first byte at the address.
    ///
    /// The original byte is recorded only after the write lands, so a failed read or
    /// write leaves the breakpoint disabled.
    pub fn enable(&mut self, tracer: &mut impl Tracer) -> TrapdbResult<()> {
        if self.is_enabled() {
            return Err(TrapdbError::BreakpointAlreadyEnabled(self.addr));
        }

        let word = tracer.read_word(self.addr.value())?;
        let original = (word & LOW_BYTE) as u8;
        let patched = (word & !LOW_BYTE) | u64::from(TRAP_INSTRUCTION[0]);
        trace!("enable {}: {word:016x} -> {patched:016x}", self.addr);
        tracer.write_word(self.addr.value(), patched)?;

        self.saved_byte = Some(original);
        Ok(())
    }

    /// Puts the original byte back. Disabling a disabled breakpoint does nothing.
    pub fn disable(&mut self, tracer: &mut impl Tracer) -> TrapdbResult<()> {
        let Some(original) = self.saved_byte else {
            return Ok(());
        };

        let word = tracer.read_word(self.addr.value())?;
        let restored = (word & !LOW_BYTE) | u64::from(original);
        trace!("disable {}: {word:016x} -> {restored:016x}", self.addr);
        tracer.write_word(self.addr.value(), restored)?;

        self.saved_byte = None;
        Ok(())
    }

    /// Forgets the patch without touching memory, for when the tracee is gone.
    pub fn abandon(&mut self) {
        self.saved_byte = None;
    }
}

/// Breakpoints keyed by runtime address, one per address.
#[derive(Debug)]
pub struct BreakpointStore {
    breakpoints: HashMap<RuntimeAddr, Breakpoint>,
    next_id: u32,
}

impl Default for BreakpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self {
            breakpoints: HashMap::new(),
            next_id: 1,
        }
    }

    /// Creates and enables a breakpoint at `addr`.
    ///
    /// A disabled breakpoint already at `addr` is re-enabled under its old id. An
    /// enabled one is left alone and the call fails with
    /// [`TrapdbError::BreakpointExists`].
    pub fn insert(
        &mut self,
        tracer: &mut impl Tracer,
        addr: RuntimeAddr,
    ) -> TrapdbResult<BreakpointId> {
        match self.breakpoints.entry(addr) {
            Entry::Occupied(mut e) => {
                if e.get().is_enabled() {
                    return Err(TrapdbError::BreakpointExists(addr));
                }
                e.get_mut().enable(tracer)?;
                Ok(e.get().id())
            }
            Entry::Vacant(v) => {
                let mut bp = Breakpoint::new(BreakpointId(self.next_id), addr);
                bp.enable(tracer)?;
                self.next_id += 1;
                debug!("breakpoint {} set at {addr}", bp.id());
                Ok(v.insert(bp).id())
            }
        }
    }

    /// Disables and drops the breakpoint at `addr`, if any.
    pub fn remove(&mut self, tracer: &mut impl Tracer, addr: RuntimeAddr) -> TrapdbResult<()> {
        let Some(bp) = self.breakpoints.get_mut(&addr) else {
            return Ok(());
        };
        bp.disable(tracer)?;
        if let Some(bp) = self.breakpoints.remove(&addr) {
            debug!("breakpoint {} at {addr} removed", bp.id());
        }
        Ok(())
    }

    pub fn get(&self, addr: RuntimeAddr) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn get_mut(&mut self, addr: RuntimeAddr) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&addr)
    }

    pub fn enabled_at(&self, addr: RuntimeAddr) -> bool {
        self.get(addr).is_some_and(Breakpoint::is_enabled)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Restores every patched byte. Stops at the first failure.
    pub fn disable_all(&mut self, tracer: &mut impl Tracer) -> TrapdbResult<()> {
        for bp in self.breakpoints.values_mut() {
            bp.disable(tracer)?;
        }
        Ok(())
    }

    pub fn abandon_all(&mut self) {
        self.breakpoints.values_mut().for_each(Breakpoint::abandon);
    }

    /// Writes a word into the tracee without clobbering the traps it covers.
    ///
    /// Bytes landing on an enabled breakpoint become that breakpoint's saved byte and
    /// the trap stays in memory, so a later disable restores what was written.
    pub fn write_through(
        &mut self,
        tracer: &mut impl Tracer,
        addr: RuntimeAddr,
        word: u64,
    ) -> TrapdbResult<()> {
        let mut bytes = word.to_le_bytes();
        let mut shadowed = Vec::new();
        for (offset, byte) in (0u64..).zip(bytes.iter_mut()) {
            let at = RuntimeAddr(addr.value().wrapping_add(offset));
            if self.enabled_at(at) {
                shadowed.push((at, *byte));
                *byte = TRAP_INSTRUCTION[0];
            }
        }

        tracer.write_word(addr.value(), u64::from_le_bytes(bytes))?;

        for (at, byte) in shadowed {
            if let Some(bp) = self.breakpoints.get_mut(&at) {
                trace!("write over {at} updates saved byte to {byte:02x}");
                bp.saved_byte = Some(byte);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::fake::FakeTracer;

    const CODE: [u8; 8] = [0x55, 0x48, 0x89, 0xe5, 0x89, 0x7d, 0xfc, 0x8b];

    fn tracer() -> FakeTracer {
        FakeTracer::new().with_code(0x1000, &CODE)
    }

    #[test_log::test]
    fn enable_then_disable_restores_the_word() {
        let mut t = tracer();
        let mut bp = Breakpoint::new(BreakpointId(1), RuntimeAddr(0x1000));

        bp.enable(&mut t).unwrap();
        assert!(bp.is_enabled());
        assert_eq!(bp.saved_byte(), Some(0x55));
        assert_eq!(t.byte(0x1000), 0xcc);
        for i in 1..8 {
            assert_eq!(t.byte(0x1000 + i), CODE[i as usize]);
        }

        bp.disable(&mut t).unwrap();
        assert!(!bp.is_enabled());
        assert_eq!(bp.saved_byte(), None);
        for i in 0..8 {
            assert_eq!(t.byte(0x1000 + i), CODE[i as usize]);
        }
    }

    #[test]
    fn disable_when_disabled_is_a_noop() {
        let mut t = tracer();
        let mut bp = Breakpoint::new(BreakpointId(1), RuntimeAddr(0x1000));
        bp.disable(&mut t).unwrap();
        assert_eq!(t.byte(0x1000), 0x55);
        assert!(!bp.is_enabled());
    }

    #[test]
    fn double_enable_is_rejected() {
        let mut t = tracer();
        let mut bp = Breakpoint::new(BreakpointId(1), RuntimeAddr(0x1000));
        bp.enable(&mut t).unwrap();
        let err = bp.enable(&mut t).unwrap_err();
        assert!(matches!(err, TrapdbError::BreakpointAlreadyEnabled(RuntimeAddr(0x1000))));
        // A second patch would have saved 0xcc.
        assert_eq!(bp.saved_byte(), Some(0x55));
    }

    #[test]
    fn failed_write_leaves_breakpoint_disabled() {
        let mut t = tracer();
        t.fail_writes = true;
        let mut bp = Breakpoint::new(BreakpointId(1), RuntimeAddr(0x1000));
        assert!(bp.enable(&mut t).is_err());
        assert!(!bp.is_enabled());
        assert_eq!(t.byte(0x1000), 0x55);
    }

    #[test]
    fn failed_restore_keeps_saved_byte() {
        let mut t = tracer();
        let mut bp = Breakpoint::new(BreakpointId(1), RuntimeAddr(0x1000));
        bp.enable(&mut t).unwrap();
        t.fail_writes = true;
        assert!(bp.disable(&mut t).is_err());
        assert!(bp.is_enabled());
        assert_eq!(bp.saved_byte(), Some(0x55));
    }

    #[test]
    fn write_through_keeps_trap_and_updates_saved_byte() {
        let mut t = tracer();
        let mut store = BreakpointStore::new();
        store.insert(&mut t, RuntimeAddr(0x1000)).unwrap();
        store.insert(&mut t, RuntimeAddr(0x1003)).unwrap();

        store
            .write_through(&mut t, RuntimeAddr(0x1000), 0x9090_9090_9090_9090)
            .unwrap();
        assert_eq!(t.byte(0x1000), 0xcc);
        assert_eq!(t.byte(0x1001), 0x90);
        assert_eq!(t.byte(0x1003), 0xcc);
        assert_eq!(store.get(RuntimeAddr(0x1003)).unwrap().saved_byte(), Some(0x90));

        store.remove(&mut t, RuntimeAddr(0x1000)).unwrap();
        store.remove(&mut t, RuntimeAddr(0x1003)).unwrap();
        for i in 0..8 {
            assert_eq!(t.byte(0x1000 + i), 0x90);
        }
    }

    #[test]
    fn failed_write_through_keeps_old_saved_byte() {
        let mut t = tracer();
        let mut store = BreakpointStore::new();
        store.insert(&mut t, RuntimeAddr(0x1000)).unwrap();
        t.fail_writes = true;
        assert!(store.write_through(&mut t, RuntimeAddr(0x1000), 0).is_err());
        assert_eq!(store.get(RuntimeAddr(0x1000)).unwrap().saved_byte(), Some(0x55));
    }

    #[test]
    fn store_refuses_double_patch() {
        let mut t = tracer();
        let mut store = BreakpointStore::new();
        let id = store.insert(&mut t, RuntimeAddr(0x1000)).unwrap();
        assert_eq!(id, BreakpointId(1));

        let err = store.insert(&mut t, RuntimeAddr(0x1000)).unwrap_err();
        assert!(matches!(err, TrapdbError::BreakpointExists(_)));
        let bp = store.get(RuntimeAddr(0x1000)).unwrap();
        assert_eq!(bp.saved_byte(), Some(0x55));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn store_reenables_a_disabled_entry() {
        let mut t = tracer();
        let mut store = BreakpointStore::new();
        let id = store.insert(&mut t, RuntimeAddr(0x1000)).unwrap();
        store
            .get_mut(RuntimeAddr(0x1000))
            .unwrap()
            .disable(&mut t)
            .unwrap();
        assert!(!store.enabled_at(RuntimeAddr(0x1000)));

        assert_eq!(store.insert(&mut t, RuntimeAddr(0x1000)).unwrap(), id);
        assert!(store.enabled_at(RuntimeAddr(0x1000)));
    }

    #[test]
    fn failed_insert_stores_nothing() {
        let mut t = tracer();
        t.fail_writes = true;
        let mut store = BreakpointStore::new();
        assert!(store.insert(&mut t, RuntimeAddr(0x1000)).is_err());
        assert!(store.is_empty());

        t.fail_writes = false;
        assert_eq!(
            store.insert(&mut t, RuntimeAddr(0x1000)).unwrap(),
            BreakpointId(1)
        );
    }

    #[test]
    fn remove_restores_and_ignores_missing() {
        let mut t = tracer();
        let mut store = BreakpointStore::new();
        store.insert(&mut t, RuntimeAddr(0x1000)).unwrap();
        store.insert(&mut t, RuntimeAddr(0x1004)).unwrap();

        store.remove(&mut t, RuntimeAddr(0x1000)).unwrap();
        store.remove(&mut t, RuntimeAddr(0x2000)).unwrap();
        assert_eq!(t.byte(0x1000), 0x55);
        assert_eq!(t.byte(0x1004), 0xcc);
        assert_eq!(store.len(), 1);

        store.disable_all(&mut t).unwrap();
        assert_eq!(t.byte(0x1004), 0x89);
    }
}

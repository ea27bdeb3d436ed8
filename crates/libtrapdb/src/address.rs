//! Static/runtime address spaces and the load bias between them.
//!
//! Addresses coming out of the executable's symbol tables are [`StaticAddr`]s. Anything
//! used to poke the tracee's memory or registers is a [`RuntimeAddr`]. For a
//! position-independent executable the two differ by the [`LoadBias`], the base the
//! loader mapped the image at.

use std::fmt;

use log::debug;
use nix::unistd::Pid;

use crate::errors::{TrapdbError, TrapdbResult};
use crate::maps::MappingSource;

/// An address in the tracee's live address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeAddr(pub u64);

/// An address as recorded in the executable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StaticAddr(pub u64);

impl RuntimeAddr {
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Address `bytes` lower, wrapping at zero.
    pub const fn rewind(self, bytes: u64) -> Self {
        RuntimeAddr(self.0.wrapping_sub(bytes))
    }
}

impl StaticAddr {
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for RuntimeAddr {
    fn from(value: u64) -> Self {
        RuntimeAddr(value)
    }
}

impl From<u64> for StaticAddr {
    fn from(value: u64) -> Self {
        StaticAddr(value)
    }
}

impl fmt::Display for RuntimeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for StaticAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How the executable expects to be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableKind {
    /// `ET_EXEC`: linked at its final addresses.
    Fixed,
    /// `ET_DYN`: relocated to wherever the loader mapped it.
    PositionIndependent,
}

/// Offset between static and runtime addresses, fixed for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadBias(u64);

impl LoadBias {
    pub const NONE: Self = LoadBias(0);

    pub const fn new(offset: u64) -> Self {
        LoadBias(offset)
    }

    /// Computes the bias of a stopped tracee.
    ///
    /// The mapping table is only populated once the tracee reached its first stop, so
    /// this must run after the bootstrap wait. Fixed executables never consult `maps`.
    pub fn compute(
        kind: ExecutableKind,
        pid: Pid,
        maps: &impl MappingSource,
    ) -> TrapdbResult<Self> {
        let bias = match kind {
            ExecutableKind::Fixed => LoadBias::NONE,
            ExecutableKind::PositionIndependent => {
                let base = maps
                    .first_base(pid)?
                    .ok_or(TrapdbError::MissingMappings(pid))?;
                LoadBias(base)
            }
        };
        debug!("load bias for pid {pid} ({kind:?}): {:#x}", bias.0);
        Ok(bias)
    }

    pub const fn offset(self) -> u64 {
        self.0
    }

    pub const fn to_runtime(self, addr: StaticAddr) -> RuntimeAddr {
        RuntimeAddr(addr.0.wrapping_add(self.0))
    }

    pub const fn to_static(self, addr: RuntimeAddr) -> StaticAddr {
        StaticAddr(addr.0.wrapping_sub(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::Mapping;

    struct StaticMaps(Vec<Mapping>);

    impl MappingSource for StaticMaps {
        fn mappings(&self, _pid: Pid) -> TrapdbResult<Vec<Mapping>> {
            Ok(self.0.clone())
        }
    }

    fn mapping(start: u64) -> Mapping {
        Mapping {
            start,
            end: start + 0x1000,
            perms: "r--p".to_string(),
            path: None,
        }
    }

    #[test]
    fn fixed_executables_have_no_bias() {
        let maps = StaticMaps(vec![mapping(0x5555_5555_4000)]);
        let bias = LoadBias::compute(ExecutableKind::Fixed, Pid::from_raw(1), &maps).unwrap();
        assert_eq!(bias, LoadBias::NONE);
        assert_eq!(bias.to_runtime(StaticAddr(0x1000)), RuntimeAddr(0x1000));
    }

    #[test]
    fn pie_bias_is_the_first_mapping() {
        let maps = StaticMaps(vec![mapping(0x5555_5555_4000), mapping(0x7fff_f7dd_0000)]);
        let bias =
            LoadBias::compute(ExecutableKind::PositionIndependent, Pid::from_raw(1), &maps)
                .unwrap();
        assert_eq!(bias.offset(), 0x5555_5555_4000);
        assert_eq!(
            bias.to_runtime(StaticAddr(0x1139)),
            RuntimeAddr(0x5555_5555_5139)
        );
    }

    #[test]
    fn pie_without_mappings_is_rejected() {
        let maps = StaticMaps(Vec::new());
        let err = LoadBias::compute(ExecutableKind::PositionIndependent, Pid::from_raw(7), &maps)
            .unwrap_err();
        assert!(matches!(err, TrapdbError::MissingMappings(pid) if pid.as_raw() == 7));
    }

    #[test]
    fn translation_round_trips() {
        let bias = LoadBias::new(0x5555_5555_4000);
        for raw in [0u64, 0x1000, 0x5555_5555_4000, 0x5555_5555_5139, u64::MAX] {
            let x = RuntimeAddr(raw);
            assert_eq!(bias.to_runtime(bias.to_static(x)), x);
        }
    }
}

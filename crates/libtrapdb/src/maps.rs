//! Memory mapping enumeration for a tracee.

use std::fmt;
use std::path::PathBuf;

use log::trace;
use nix::unistd::Pid;

use crate::errors::TrapdbResult;

/// One line of the tracee's mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    /// `rwx` flags, `-` where a permission is missing.
    pub perms: String,
    pub path: Option<PathBuf>,
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}-{:012x} {}", self.start, self.end, self.perms)?;
        if let Some(path) = &self.path {
            write!(f, " {}", path.display())?;
        }
        Ok(())
    }
}

/// Source of a process's memory mappings, ordered by start address.
pub trait MappingSource {
    fn mappings(&self, pid: Pid) -> TrapdbResult<Vec<Mapping>>;

    /// Base address of the lowest mapping, if the table has any entry.
    fn first_base(&self, pid: Pid) -> TrapdbResult<Option<u64>> {
        Ok(self.mappings(pid)?.first().map(|m| m.start))
    }
}

/// Reads `/proc/<pid>/maps`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMaps;

impl MappingSource for ProcMaps {
    fn mappings(&self, pid: Pid) -> TrapdbResult<Vec<Mapping>> {
        let ranges = proc_maps::get_process_maps(pid.as_raw())?;
        trace!("pid {pid}: {} mappings", ranges.len());

        Ok(ranges
            .iter()
            .map(|range| {
                let perms = [
                    (range.is_read(), 'r'),
                    (range.is_write(), 'w'),
                    (range.is_exec(), 'x'),
                ]
                .iter()
                .map(|&(set, c)| if set { c } else { '-' })
                .collect();

                Mapping {
                    start: range.start() as u64,
                    end: (range.start() + range.size()) as u64,
                    perms,
                    path: range.filename().map(PathBuf::from),
                }
            })
            .collect())
    }
}

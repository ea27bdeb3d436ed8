//! Symbol and line lookups against the executable's DWARF, in static addresses.

use std::fmt;
use std::path::{Path, PathBuf};

use addr2line::Loader;
use log::{debug, trace};
use object::{Object, ObjectKind};

use crate::address::{ExecutableKind, StaticAddr};
use crate::errors::{TrapdbError, TrapdbResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// Answers address queries about the executable being debugged.
pub trait SymbolResolver {
    fn executable_kind(&self) -> ExecutableKind;

    /// Source line covering `addr`; [`TrapdbError::NotFound`] when there is none.
    fn location(&self, addr: StaticAddr) -> TrapdbResult<SourceLocation>;

    fn function_name(&self, addr: StaticAddr) -> Option<String>;
}

/// Resolver backed by the ELF symbol table and DWARF line program.
pub struct DwarfResolver {
    path: PathBuf,
    kind: ExecutableKind,
    entry: StaticAddr,
    loader: Loader,
}

impl DwarfResolver {
    pub fn load(path: impl AsRef<Path>) -> TrapdbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        let file =
            object::File::parse(&*data).map_err(|e| TrapdbError::Symbols(e.to_string()))?;

        let kind = match file.kind() {
            ObjectKind::Dynamic => ExecutableKind::PositionIndependent,
            _ => ExecutableKind::Fixed,
        };
        let entry = StaticAddr(file.entry());

        let loader = Loader::new(&path).map_err(|e| TrapdbError::Symbols(e.to_string()))?;
        debug!(
            "loaded symbols for {} ({kind:?}, entry {entry})",
            path.display()
        );

        Ok(Self {
            path,
            kind,
            entry,
            loader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry point from the ELF header.
    pub fn entry_point(&self) -> StaticAddr {
        self.entry
    }
}

impl SymbolResolver for DwarfResolver {
    fn executable_kind(&self) -> ExecutableKind {
        self.kind
    }

    fn location(&self, addr: StaticAddr) -> TrapdbResult<SourceLocation> {
        let location = self
            .loader
            .find_location(addr.value())
            .map_err(|e| TrapdbError::Symbols(e.to_string()))?;
        trace!("line lookup {addr}: {:?}", location.as_ref().map(|l| (l.file, l.line)));

        match location {
            Some(addr2line::Location {
                file: Some(file),
                line: Some(line),
                ..
            }) => Ok(SourceLocation {
                file: PathBuf::from(file),
                line,
            }),
            _ => Err(TrapdbError::NotFound(addr)),
        }
    }

    fn function_name(&self, addr: StaticAddr) -> Option<String> {
        self.loader.find_symbol(addr.value()).map(str::to_string)
    }
}

//! Redirecting allocator imports of loaded libraries to the engine's trampolines.
//!
//! The installer is platform-agnostic: it decides which libraries and symbols to redirect and
//! keeps the undo log.  Reading and writing relocation slots is delegated to a
//! [`HookBackend`]; [`GotBackend`] is the ELF implementation used in production.

use std::{fmt, io};

use crate::{
    error::{Error, Result},
    filter::{base_name, LibraryFilter},
};

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod got;
pub mod trampoline;

pub use got::GotBackend;
pub use trampoline::{targets, HookTarget};

/// A loaded shared object as seen by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedLibrary {
    pub path: String,
    /// Load bias.
    pub base: usize,
    /// Address of the dynamic section, 0 if none.
    pub dynamic: usize,
}

/// One relocation slot rewritten by [`HookBackend::patch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchedSlot {
    pub address: usize,
    /// Slot contents before the rewrite.
    pub original: usize,
}

/// Reads and rewrites import slots of loaded libraries.
pub trait HookBackend: Send {
    /// Every loaded object, in load order.
    fn libraries(&mut self) -> io::Result<Vec<LoadedLibrary>>;

    /// Point every import of `symbol` in `library` at `replacement`.  Returns the rewritten
    /// slots; empty when `library` does not import `symbol`.
    fn patch(
        &mut self,
        library: &LoadedLibrary,
        symbol: &str,
        replacement: usize,
    ) -> io::Result<Vec<PatchedSlot>>;

    /// Write `slot.original` back.
    fn restore(&mut self, slot: &PatchedSlot) -> io::Result<()>;
}

/// Undo-log entry for one rewritten slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookRecord {
    pub library: String,
    pub base: usize,
    pub symbol: &'static str,
    pub original: usize,
    pub trampoline: usize,
    pub slot: usize,
}

impl fmt::Display for HookRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:#x} {} slot {:#x}: {:#x} -> {:#x}",
            base_name(&self.library),
            self.base,
            self.symbol,
            self.slot,
            self.original,
            self.trampoline
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallSummary {
    /// Eligible libraries visited.
    pub libraries: usize,
    /// Slots rewritten.
    pub slots: usize,
    /// `(library, symbol)` pairs skipped because the library does not import the symbol.
    pub missing: Vec<(String, &'static str)>,
}

pub struct HookInstaller<B: HookBackend> {
    backend: B,
    records: Vec<HookRecord>,
}

impl<B: HookBackend> HookInstaller<B> {
    pub fn new(backend: B) -> Self {
        HookInstaller {
            backend,
            records: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn records(&self) -> &[HookRecord] {
        &self.records
    }

    pub fn is_installed(&self) -> bool {
        !self.records.is_empty()
    }

    /// Redirect `targets` in every library `filter` accepts.
    ///
    /// A library that does not import a target is skipped for that target.  A failed write
    /// restores every slot rewritten so far and returns [`Error::HookInstall`].
    pub fn install(&mut self, filter: &LibraryFilter, targets: &[HookTarget]) -> Result<InstallSummary> {
        let libraries = self.backend.libraries()?;
        let mut summary = InstallSummary::default();
        for library in &libraries {
            if !filter.is_eligible(&library.path) {
                tracing::debug!("not hooking {:?}", library.path);
                continue;
            }
            summary.libraries += 1;
            for target in targets {
                match self.backend.patch(library, target.symbol, target.replacement) {
                    Ok(slots) if slots.is_empty() => {
                        let skipped = Error::SymbolNotFound {
                            library: library.path.clone(),
                            symbol: target.symbol,
                        };
                        if filter.matches_all() {
                            tracing::debug!("{}", skipped);
                        } else {
                            tracing::warn!("{}", skipped);
                        }
                        summary.missing.push((library.path.clone(), target.symbol));
                    }
                    Ok(slots) => {
                        summary.slots += slots.len();
                        for slot in slots {
                            let record = HookRecord {
                                library: library.path.clone(),
                                base: library.base,
                                symbol: target.symbol,
                                original: slot.original,
                                trampoline: target.replacement,
                                slot: slot.address,
                            };
                            tracing::debug!("hooked {}", record);
                            self.records.push(record);
                        }
                    }
                    Err(source) => {
                        let restored = self.uninstall();
                        tracing::warn!(
                            "hooking {} in {:?} failed, restored {} slots",
                            target.symbol,
                            library.path,
                            restored
                        );
                        return Err(Error::HookInstall {
                            library: library.path.clone(),
                            symbol: target.symbol,
                            source,
                        });
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Restore every rewritten slot, newest first.  Returns the number of slots restored.
    pub fn uninstall(&mut self) -> usize {
        let mut restored = 0;
        while let Some(record) = self.records.pop() {
            let slot = PatchedSlot {
                address: record.slot,
                original: record.original,
            };
            match self.backend.restore(&slot) {
                Ok(()) => restored += 1,
                Err(e) => tracing::error!("failed to restore {}: {}", record, e),
            }
        }
        restored
    }
}

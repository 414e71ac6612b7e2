//! In-memory [`HookBackend`] for exercising the installer and sessions without touching
//! real relocation tables.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
};

use super::{HookBackend, LoadedLibrary, PatchedSlot};

/// In-memory backend: each library has a set of imported symbols, each import one slot.
#[derive(Default)]
pub struct FakeBackend {
    pub libraries: Vec<LoadedLibrary>,
    pub imports: BTreeMap<(String, String), usize>,
    pub slots: BTreeMap<usize, usize>,
    /// Writes to these slot addresses fail.
    pub read_only: BTreeSet<usize>,
    next_slot: usize,
}

impl FakeBackend {
    /// Add a library importing `symbols`, one fresh slot each.
    pub fn with_library(mut self, path: &str, symbols: &[&str]) -> Self {
        let base = 0x1000_0000 * (self.libraries.len() + 1);
        self.libraries.push(LoadedLibrary {
            path: path.to_string(),
            base,
            dynamic: base + 0x100,
        });
        for symbol in symbols {
            self.next_slot += 8;
            let slot = base + 0x2000 + self.next_slot;
            self.imports.insert((path.to_string(), symbol.to_string()), slot);
            self.slots.insert(slot, 0xdead_0000 + self.next_slot);
        }
        self
    }

    /// Address of the slot through which `path` imports `symbol`.
    pub fn slot(&self, path: &str, symbol: &str) -> usize {
        self.imports[&(path.to_string(), symbol.to_string())]
    }

    pub fn value(&self, path: &str, symbol: &str) -> usize {
        self.slots[&self.slot(path, symbol)]
    }
}

impl HookBackend for FakeBackend {
    fn libraries(&mut self) -> io::Result<Vec<LoadedLibrary>> {
        Ok(self.libraries.clone())
    }

    fn patch(
        &mut self,
        library: &LoadedLibrary,
        symbol: &str,
        replacement: usize,
    ) -> io::Result<Vec<PatchedSlot>> {
        let slot = match self.imports.get(&(library.path.clone(), symbol.to_string())) {
            Some(slot) => *slot,
            None => return Ok(Vec::new()),
        };
        if self.read_only.contains(&slot) {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        let original = self.slots.insert(slot, replacement).unwrap_or_default();
        Ok(vec![PatchedSlot { address: slot, original }])
    }

    fn restore(&mut self, slot: &PatchedSlot) -> io::Result<()> {
        self.slots.insert(slot.address, slot.original);
        Ok(())
    }
}

//! GOT patching for ELF objects loaded into the current process.
//!
//! Every import of a symbol goes through a relocation slot in the importing object (a PLT
//! jump slot for calls, a GLOB_DAT or absolute slot for address-taken uses).  Rewriting those
//! slots redirects the object's calls without touching code.

use std::{
    ffi::CStr,
    io, mem, slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use libc::{c_int, c_void, dl_phdr_info, size_t};
use object::{
    elf::{self, Dyn64, Rela64, Sym64},
    NativeEndian,
};

use super::{HookBackend, LoadedLibrary, PatchedSlot};
use crate::maps::{self, MapEntry};

#[cfg(target_arch = "x86_64")]
const IMPORT_RELOCATIONS: &[u32] = &[
    elf::R_X86_64_JUMP_SLOT,
    elf::R_X86_64_GLOB_DAT,
    elf::R_X86_64_64,
];
#[cfg(target_arch = "aarch64")]
const IMPORT_RELOCATIONS: &[u32] = &[
    elf::R_AARCH64_JUMP_SLOT,
    elf::R_AARCH64_GLOB_DAT,
    elf::R_AARCH64_ABS64,
];
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const IMPORT_RELOCATIONS: &[u32] = &[];

#[derive(Default)]
pub struct GotBackend {
    maps: Vec<MapEntry>,
}

impl GotBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_maps(&mut self) -> io::Result<()> {
        self.maps = maps::read("/proc/self/maps".as_ref())?;
        Ok(())
    }

    /// Current protection of the page holding `address`.
    fn protection(&mut self, address: usize) -> io::Result<c_int> {
        let find = |maps: &[MapEntry]| {
            maps.iter()
                .find(|m| (m.start..m.end).contains(&(address as u64)))
                .map(|m| protection_bits(&m.perms))
        };
        if let Some(prot) = find(&self.maps) {
            return Ok(prot);
        }
        self.refresh_maps()?;
        find(&self.maps).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:#x} is not mapped", address),
            )
        })
    }

    /// Store `value` into the slot at `address`, making its page writable for the duration.
    fn write_slot(&mut self, address: usize, value: usize) -> io::Result<usize> {
        let prot = self.protection(address)?;
        let page = page_size();
        let start = (address & !(page - 1)) as *mut c_void;
        let read_only = prot & libc::PROT_WRITE == 0;
        // SAFETY: `start` is the page holding a mapped slot; only its protection changes.
        if read_only && unsafe { libc::mprotect(start, page, prot | libc::PROT_WRITE) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: relocation slots are pointer-sized and pointer-aligned, and the page is
        // writable.  Other threads may be calling through the slot, hence the atomic store.
        let previous = unsafe { (*(address as *const AtomicUsize)).swap(value, Ordering::SeqCst) };
        if read_only && unsafe { libc::mprotect(start, page, prot) } != 0 {
            tracing::warn!(
                "slot {:#x} rewritten but page protection not restored: {}",
                address,
                io::Error::last_os_error()
            );
        }
        Ok(previous)
    }
}

impl HookBackend for GotBackend {
    fn libraries(&mut self) -> io::Result<Vec<LoadedLibrary>> {
        let mut libraries: Vec<LoadedLibrary> = Vec::new();
        // SAFETY: the callback only touches `libraries` through `data`.
        unsafe {
            libc::dl_iterate_phdr(Some(collect), &mut libraries as *mut _ as *mut c_void);
        }
        self.refresh_maps()?;
        Ok(libraries)
    }

    fn patch(
        &mut self,
        library: &LoadedLibrary,
        symbol: &str,
        replacement: usize,
    ) -> io::Result<Vec<PatchedSlot>> {
        let mut patched = Vec::new();
        for address in import_slots(library, symbol) {
            match self.write_slot(address, replacement) {
                Ok(original) => patched.push(PatchedSlot { address, original }),
                Err(e) => {
                    for slot in patched.iter().rev() {
                        let _ = self.restore(slot);
                    }
                    return Err(e);
                }
            }
        }
        Ok(patched)
    }

    fn restore(&mut self, slot: &PatchedSlot) -> io::Result<()> {
        self.write_slot(slot.address, slot.original).map(|_| ())
    }
}

unsafe extern "C" fn collect(info: *mut dl_phdr_info, _size: size_t, data: *mut c_void) -> c_int {
    let libraries = &mut *(data as *mut Vec<LoadedLibrary>);
    let info = &*info;
    let path = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };
    let base = info.dlpi_addr as usize;
    let headers = slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let dynamic = headers
        .iter()
        .find(|h| h.p_type == libc::PT_DYNAMIC)
        .map(|h| base + h.p_vaddr as usize)
        .unwrap_or(0);
    libraries.push(LoadedLibrary {
        path,
        base,
        dynamic,
    });
    0
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn protection_bits(perms: &str) -> c_int {
    let bytes = perms.as_bytes();
    let mut prot = libc::PROT_NONE;
    if bytes.first() == Some(&b'r') {
        prot |= libc::PROT_READ;
    }
    if bytes.get(1) == Some(&b'w') {
        prot |= libc::PROT_WRITE;
    }
    if bytes.get(2) == Some(&b'x') {
        prot |= libc::PROT_EXEC;
    }
    prot
}

#[derive(Default)]
struct DynamicInfo {
    symtab: usize,
    strtab: usize,
    strsz: usize,
    jmprel: usize,
    pltrelsz: usize,
    rela: usize,
    relasz: usize,
}

// Some loaders relocate pointer entries of the dynamic section in place, some leave them
// relative to the load bias.
fn absolute(base: usize, value: u64) -> usize {
    let value = value as usize;
    if value < base {
        base + value
    } else {
        value
    }
}

fn dynamic_info(library: &LoadedLibrary) -> Option<DynamicInfo> {
    if library.dynamic == 0 {
        return None;
    }
    let mut info = DynamicInfo::default();
    let mut entry = library.dynamic as *const Dyn64<NativeEndian>;
    loop {
        // SAFETY: `dynamic` points at the loaded object's DT_NULL-terminated dynamic section.
        let (tag, value) = unsafe { ((*entry).d_tag.get(NativeEndian), (*entry).d_val.get(NativeEndian)) };
        match u32::try_from(tag).unwrap_or(u32::MAX) {
            elf::DT_NULL => break,
            elf::DT_SYMTAB => info.symtab = absolute(library.base, value),
            elf::DT_STRTAB => info.strtab = absolute(library.base, value),
            elf::DT_STRSZ => info.strsz = value as usize,
            elf::DT_JMPREL => info.jmprel = absolute(library.base, value),
            elf::DT_PLTRELSZ => info.pltrelsz = value as usize,
            elf::DT_RELA => info.rela = absolute(library.base, value),
            elf::DT_RELASZ => info.relasz = value as usize,
            _ => {}
        }
        // SAFETY: not past DT_NULL yet.
        entry = unsafe { entry.add(1) };
    }
    if info.symtab == 0 || info.strtab == 0 {
        return None;
    }
    Some(info)
}

/// Addresses of every relocation slot through which `library` imports `symbol`.
fn import_slots(library: &LoadedLibrary, symbol: &str) -> Vec<usize> {
    let info = match dynamic_info(library) {
        Some(info) => info,
        None => return Vec::new(),
    };
    let tables = [(info.jmprel, info.pltrelsz), (info.rela, info.relasz)];
    let mut slots = Vec::new();
    for (table, size) in tables {
        if table == 0 || size == 0 {
            continue;
        }
        let count = size / mem::size_of::<Rela64<NativeEndian>>();
        // SAFETY: DT_JMPREL/DT_RELA describe arrays of `count` relocations in loaded memory.
        let relocations =
            unsafe { slice::from_raw_parts(table as *const Rela64<NativeEndian>, count) };
        for rela in relocations {
            let kind = rela.r_type(NativeEndian, false);
            let index = rela.r_sym(NativeEndian, false);
            if index == 0 || !IMPORT_RELOCATIONS.contains(&kind) {
                continue;
            }
            if symbol_name(&info, index as usize) == Some(symbol.as_bytes()) {
                let slot = library.base + rela.r_offset.get(NativeEndian) as usize;
                if !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
        }
    }
    slots
}

fn symbol_name(info: &DynamicInfo, index: usize) -> Option<&'static [u8]> {
    // SAFETY: relocation symbol indices refer to DT_SYMTAB of the same object.
    let sym = unsafe { &*((info.symtab as *const Sym64<NativeEndian>).add(index)) };
    let offset = sym.st_name.get(NativeEndian) as usize;
    if info.strsz != 0 && offset >= info.strsz {
        return None;
    }
    // SAFETY: in bounds of DT_STRTAB, which holds NUL-terminated names.
    Some(unsafe { CStr::from_ptr((info.strtab + offset) as *const libc::c_char) }.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::trampoline::malloc_hook;
    use serial_test::serial;

    fn read_slot(address: usize) -> usize {
        unsafe { *(address as *const usize) }
    }

    fn current_protection(address: usize) -> c_int {
        GotBackend::new().protection(address).unwrap()
    }

    #[test]
    fn enumerates_loaded_objects() {
        let mut backend = GotBackend::new();
        let libraries = backend.libraries().unwrap();
        let libc = libraries
            .iter()
            .find(|l| l.path.contains("libc.so"))
            .expect("libc is loaded");
        assert_ne!(libc.dynamic, 0);
        assert!(dynamic_info(libc).is_some());
    }

    #[test]
    fn missing_symbols_have_no_slots() {
        let mut backend = GotBackend::new();
        for library in backend.libraries().unwrap() {
            assert!(import_slots(&library, "no_such_symbol_anywhere").is_empty());
        }
    }

    #[test]
    fn protection_of_stack_is_writable() {
        let local = 0u64;
        let mut backend = GotBackend::new();
        let prot = backend.protection(&local as *const u64 as usize).unwrap();
        assert_eq!(prot & libc::PROT_WRITE, libc::PROT_WRITE);
    }

    #[test]
    fn read_only_page_is_written_and_protected_again() {
        let page = page_size();
        let start = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(start, libc::MAP_FAILED);
        let slot = start as usize + 64;
        unsafe {
            *(slot as *mut usize) = 0x1111;
            assert_eq!(libc::mprotect(start, page, libc::PROT_READ), 0);
        }
        assert_eq!(current_protection(slot), libc::PROT_READ);

        let mut backend = GotBackend::new();
        assert_eq!(backend.write_slot(slot, 0x2222).unwrap(), 0x1111);
        assert_eq!(read_slot(slot), 0x2222);
        assert_eq!(current_protection(slot), libc::PROT_READ);

        unsafe { libc::munmap(start, page) };
    }

    #[test]
    #[serial]
    #[cfg(target_env = "gnu")]
    fn patches_and_restores_a_real_import() {
        let mut backend = GotBackend::new();
        // The executable holds the trampolines and their own imports, so it is never patched.
        let libraries: Vec<_> = backend
            .libraries()
            .unwrap()
            .into_iter()
            .filter(|l| !l.path.is_empty() && !l.path.contains("vdso"))
            .collect();
        let (library, slots) = libraries
            .iter()
            .map(|l| (l, import_slots(l, "malloc")))
            .find(|(_, slots)| !slots.is_empty())
            .expect("a shared object importing malloc");

        let before: Vec<_> = slots.iter().map(|s| current_protection(*s)).collect();
        let replacement = malloc_hook as usize;
        let patched = backend.patch(library, "malloc", replacement).unwrap();
        assert_eq!(
            patched.iter().map(|p| p.address).collect::<Vec<_>>(),
            slots
        );
        for (slot, prot) in patched.iter().zip(&before) {
            assert_ne!(slot.original, replacement);
            assert_eq!(read_slot(slot.address), replacement);
            assert_eq!(current_protection(slot.address), *prot, "{}", library.path);
        }

        for slot in patched.iter().rev() {
            backend.restore(slot).unwrap();
        }
        for (slot, prot) in patched.iter().zip(&before) {
            assert_eq!(read_slot(slot.address), slot.original);
            assert_eq!(current_protection(slot.address), *prot);
        }
    }

    #[test]
    fn parses_permissions() {
        assert_eq!(protection_bits("r-xp"), libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(protection_bits("rw-p"), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(protection_bits("---p"), libc::PROT_NONE);
    }
}

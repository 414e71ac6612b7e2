//! Fixed-size backing memory for the ledger.
//!
//! In large-map mode the arena is a shared file mapping in the storage directory, so ledger
//! growth never goes through the allocator that is being observed.  Otherwise it is a plain
//! heap buffer allocated once at start.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;

pub const ARENA_FILE: &str = "ledger.arena";

const MAGIC: &[u8; 8] = b"MATTRIB1";
/// Bytes reserved at the start of the arena for the header.  Keeps the payload page-aligned
/// on file-backed arenas and 8-byte aligned everywhere.
pub const HEADER_LEN: usize = 64;

enum Backing {
    Mapped {
        map: MmapMut,
        path: PathBuf,
        _file: File,
    },
    // u64 elements for alignment.
    Heap(Box<[u64]>),
}

pub struct Arena {
    backing: Backing,
    len: usize,
}

impl Arena {
    /// Reserve `payload` bytes in a fresh heap buffer.
    pub fn heap(payload: usize) -> Self {
        let len = HEADER_LEN + payload;
        let words = (len + 7) / 8;
        let mut arena = Arena {
            backing: Backing::Heap(vec![0u64; words].into_boxed_slice()),
            len,
        };
        arena.write_header(payload);
        arena
    }

    /// Create (or truncate) `dir/ledger.arena` with room for `payload` bytes and map it.
    pub fn file(dir: &Path, payload: usize) -> io::Result<Self> {
        let len = HEADER_LEN + payload;
        let path = dir.join(ARENA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len as u64)?;
        // SAFETY: the file was just created by us and is only ever accessed through this map.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut arena = Arena {
            backing: Backing::Mapped {
                map,
                path,
                _file: file,
            },
            len,
        };
        arena.write_header(payload);
        Ok(arena)
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Mapped { path, .. } => Some(path),
            Backing::Heap(_) => None,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.len - HEADER_LEN
    }

    /// Start of the payload.  Valid for `payload_len()` bytes for the lifetime of the arena,
    /// 8-byte aligned.
    pub fn payload_ptr(&mut self) -> *mut u8 {
        // SAFETY: HEADER_LEN < len by construction.
        unsafe { self.base_ptr().add(HEADER_LEN) }
    }

    fn base_ptr(&mut self) -> *mut u8 {
        match &mut self.backing {
            Backing::Mapped { map, .. } => map.as_mut_ptr(),
            Backing::Heap(words) => words.as_mut_ptr() as *mut u8,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: both backings are at least `len` bytes long.
        unsafe { std::slice::from_raw_parts_mut(self.base_ptr(), len) }
    }

    fn write_header(&mut self, payload: usize) {
        let header = &mut self.bytes_mut()[..HEADER_LEN];
        header[..8].copy_from_slice(MAGIC);
        LittleEndian::write_u64(&mut header[8..16], payload as u64);
        LittleEndian::write_u32(&mut header[16..20], std::process::id());
    }

    /// Header fields `(payload length, owning pid)`, `None` if the magic does not match.
    pub fn read_header(bytes: &[u8]) -> Option<(u64, u32)> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return None;
        }
        Some((
            LittleEndian::read_u64(&bytes[8..16]),
            LittleEndian::read_u32(&bytes[16..20]),
        ))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Backing::Mapped { path, .. } = &self.backing {
            if let Err(e) = fs::remove_file(path) {
                tracing::debug!("failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_arena_is_zeroed_and_aligned() {
        let mut arena = Arena::heap(1000);
        assert!(!arena.is_file_backed());
        assert_eq!(arena.payload_len(), 1000);
        let ptr = arena.payload_ptr();
        assert_eq!(ptr as usize % 8, 0);
        let payload = unsafe { std::slice::from_raw_parts(ptr, 1000) };
        assert!(payload.iter().all(|b| *b == 0));
    }

    #[test]
    fn file_arena_lives_in_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ARENA_FILE);
        {
            let mut arena = Arena::file(dir.path(), 4096).unwrap();
            assert!(arena.is_file_backed());
            assert_eq!(arena.path(), Some(path.as_path()));
            unsafe { *arena.payload_ptr() = 0xab };
            let bytes = fs::read(&path).unwrap();
            assert_eq!(bytes.len(), HEADER_LEN + 4096);
            assert_eq!(
                Arena::read_header(&bytes),
                Some((4096, std::process::id()))
            );
        }
        assert!(!path.exists());
    }
}

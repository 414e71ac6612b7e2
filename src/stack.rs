//! Call stack capture and interning.

use std::{
    fmt,
    hash::Hasher,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use fnv::FnvHasher;

use crate::config::MAX_DEPTH;

/// Identifier of an interned call stack.  Assigned sequentially, never reused within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackId(pub u32);

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Return addresses of one call, innermost first.  Fixed size so that capturing a stack
/// inside an allocator hook never allocates.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frames {
    len: u8,
    ips: [usize; MAX_DEPTH],
}

impl Frames {
    pub const fn empty() -> Self {
        Frames {
            len: 0,
            ips: [0; MAX_DEPTH],
        }
    }

    /// Build from a slice, keeping at most `MAX_DEPTH` innermost frames.
    pub fn from_slice(ips: &[usize]) -> Self {
        let mut frames = Self::empty();
        for ip in ips.iter().take(MAX_DEPTH) {
            frames.push(*ip);
        }
        frames
    }

    fn push(&mut self, ip: usize) -> bool {
        let len = self.len as usize;
        if len == MAX_DEPTH {
            return false;
        }
        self.ips[len] = ip;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.ips[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// FNV-1a over the addresses.  Stable across runs of the same binary, used for display.
    pub fn hash64(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for ip in self.as_slice() {
            hasher.write_usize(*ip);
        }
        hasher.finish()
    }
}

impl fmt::Debug for Frames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|ip| format!("{:#x}", ip)))
            .finish()
    }
}

// Frames walked while looking for an entry point before giving up on finding one.
const MAX_WALK: usize = 128;

/// Walk the current thread's stack.
///
/// Frames up to and including the innermost one whose function starts at an address in
/// `entry_points` (the trampoline that was entered) are engine frames and are dropped, then
/// up to `max_depth` return addresses of its callers are kept.  When no entry point is on the
/// stack the innermost `skip` frames are dropped instead.
#[inline(never)]
pub fn capture(max_depth: usize, entry_points: &[usize], skip: usize) -> Frames {
    let max_depth = max_depth.clamp(1, MAX_DEPTH);
    let mut callers = Frames::empty();
    let mut fallback = Frames::empty();
    let mut entered = false;
    let mut walked = 0;
    // SAFETY: the unsynchronized variant is used because the synchronized one takes a
    // process-wide lock on every allocation.  Concurrent unwinding is supported by the
    // platform unwinders used on Linux.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;
            if entered {
                callers.push(ip);
                return callers.len() < max_depth;
            }
            walked += 1;
            if walked > skip && fallback.len() < max_depth {
                fallback.push(ip);
            }
            if entry_points.contains(&(frame.symbol_address() as usize)) {
                entered = true;
                return true;
            }
            if entry_points.is_empty() {
                fallback.len() < max_depth
            } else {
                walked < MAX_WALK
            }
        });
    }
    if entered {
        callers
    } else {
        fallback
    }
}

/// Interned call stack.
#[derive(Debug)]
pub struct CallStackEntry {
    pub id: StackId,
    pub hash: u64,
    pub frames: Frames,
    refs: AtomicUsize,
}

impl CallStackEntry {
    /// Number of live allocations currently attributed to this stack.
    pub fn live(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

/// Append-only mapping between frame sequences and [`StackId`]s.
#[derive(Debug, Default)]
pub struct StackTable {
    by_frames: DashMap<Frames, StackId>,
    entries: DashMap<StackId, CallStackEntry>,
    next_id: AtomicU32,
}

impl StackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the identifier for `frames`, creating an entry on first sight.
    pub fn intern(&self, frames: &Frames) -> StackId {
        if let Some(id) = self.by_frames.get(frames) {
            return *id;
        }
        // The entry is published while the `by_frames` shard is locked, so any id handed out
        // already resolves.  Lock order is always `by_frames` then `entries`.
        *self.by_frames.entry(*frames).or_insert_with(|| {
            let id = StackId(self.next_id.fetch_add(1, Ordering::Relaxed));
            self.entries.insert(
                id,
                CallStackEntry {
                    id,
                    hash: frames.hash64(),
                    frames: *frames,
                    refs: AtomicUsize::new(0),
                },
            );
            id
        })
    }

    pub fn retain(&self, id: StackId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.refs.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn release(&self, id: StackId) {
        if let Some(entry) = self.entries.get(&id) {
            let _ = entry
                .refs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1));
        }
    }

    pub fn frames(&self, id: StackId) -> Option<Frames> {
        self.entries.get(&id).map(|entry| entry.frames)
    }

    pub fn hash(&self, id: StackId) -> Option<u64> {
        self.entries.get(&id).map(|entry| entry.hash)
    }

    pub fn live(&self, id: StackId) -> usize {
        self.entries.get(&id).map(|entry| entry.live()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

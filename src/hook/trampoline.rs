//! Replacement entry points installed into hooked libraries' GOTs.
//!
//! Every trampoline calls the real function through this library's own imports (this library
//! is never hooked, so those always reach the real allocator) and reports the
//! result to the attached [`Tracker`], if any.  A trampoline never fails on the engine's
//! behalf: engine panics are caught here and the call completes as if it were not hooked.

use std::{
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use libc::{c_int, c_void, off_t, size_t};

use crate::{guard::ReentryGuard, tracker::Tracker};

static TRACKER: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Route trampoline calls to `tracker`.  The caller keeps `tracker` alive until [`detach`]
/// has returned.
pub(crate) fn attach(tracker: &Arc<Tracker>) {
    TRACKER.store(Arc::as_ptr(tracker) as *mut Tracker, Ordering::SeqCst);
}

/// Stop routing calls and wait until no trampoline still uses the previous tracker.
pub(crate) fn detach() {
    TRACKER.store(ptr::null_mut(), Ordering::SeqCst);
    while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
        thread::yield_now();
    }
}

pub(crate) fn is_attached() -> bool {
    !TRACKER.load(Ordering::SeqCst).is_null()
}

// Run `f` against the attached tracker.  `None` when none is attached or `f` panicked.
fn dispatch<R, F: FnOnce(&Tracker) -> R>(symbol: &str, f: F) -> Option<R> {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let tracker = TRACKER.load(Ordering::SeqCst);
    let mut result = None;
    if !tracker.is_null() {
        // SAFETY: non-null pointers come from `attach`, and `detach` waits for IN_FLIGHT to
        // drain before the owner drops the tracker.
        let tracker = unsafe { &*tracker };
        match panic::catch_unwind(AssertUnwindSafe(|| f(tracker))) {
            Ok(value) => result = Some(value),
            Err(cause) => {
                let message = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                tracing::error!("{} hook failed, passing through: {}", symbol, message);
            }
        }
    }
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    result
}

/// `malloc` replacement.
///
/// # Safety
///
/// Same contract as `malloc(3)`.
#[inline(never)]
pub unsafe extern "C" fn malloc_hook(size: size_t) -> *mut c_void {
    let _guard = match ReentryGuard::enter() {
        Some(guard) => guard,
        None => return libc::malloc(size),
    };
    let address = libc::malloc(size);
    if !address.is_null() {
        dispatch("malloc", |t| t.on_heap_alloc(address as usize, size));
    }
    address
}

/// `calloc` replacement.
///
/// # Safety
///
/// Same contract as `calloc(3)`.
#[inline(never)]
pub unsafe extern "C" fn calloc_hook(count: size_t, size: size_t) -> *mut c_void {
    let _guard = match ReentryGuard::enter() {
        Some(guard) => guard,
        None => return libc::calloc(count, size),
    };
    let address = libc::calloc(count, size);
    if !address.is_null() {
        let bytes = count.saturating_mul(size);
        dispatch("calloc", |t| t.on_heap_alloc(address as usize, bytes));
    }
    address
}

/// `realloc` replacement.
///
/// # Safety
///
/// Same contract as `realloc(3)`.
#[inline(never)]
pub unsafe extern "C" fn realloc_hook(old: *mut c_void, size: size_t) -> *mut c_void {
    let _guard = match ReentryGuard::enter() {
        Some(guard) => guard,
        None => return libc::realloc(old, size),
    };
    // The old block may be reissued to another thread as soon as the real call frees it.
    let taken = dispatch("realloc", |t| t.before_heap_realloc(old as usize)).flatten();
    let address = libc::realloc(old, size);
    dispatch("realloc", |t| t.on_heap_realloc(taken, address as usize, size));
    address
}

/// `memalign` replacement.
///
/// # Safety
///
/// Same contract as `memalign(3)`.
#[inline(never)]
pub unsafe extern "C" fn memalign_hook(alignment: size_t, size: size_t) -> *mut c_void {
    let _guard = match ReentryGuard::enter() {
        Some(guard) => guard,
        None => return libc::memalign(alignment, size),
    };
    let address = libc::memalign(alignment, size);
    if !address.is_null() {
        dispatch("memalign", |t| t.on_heap_alloc(address as usize, size));
    }
    address
}

/// `free` replacement.
///
/// # Safety
///
/// Same contract as `free(3)`.
#[inline(never)]
pub unsafe extern "C" fn free_hook(address: *mut c_void) {
    if address.is_null() {
        return libc::free(address);
    }
    let _guard = match ReentryGuard::enter() {
        Some(guard) => guard,
        None => return libc::free(address),
    };
    // Forget the record before the address can be handed out again.
    dispatch("free", |t| t.on_heap_free(address as usize));
    libc::free(address);
}

/// `mmap` and `mmap64` replacement (identical on 64-bit targets).
///
/// # Safety
///
/// Same contract as `mmap(2)`.
#[inline(never)]
pub unsafe extern "C" fn mmap_hook(
    hint: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let _guard = match ReentryGuard::enter() {
        Some(guard) => guard,
        None => return libc::mmap(hint, length, prot, flags, fd, offset),
    };
    let address = libc::mmap(hint, length, prot, flags, fd, offset);
    if address != libc::MAP_FAILED {
        dispatch("mmap", |t| t.on_map(address as usize, length));
    }
    address
}

/// `munmap` replacement.
///
/// # Safety
///
/// Same contract as `munmap(2)`.
#[inline(never)]
pub unsafe extern "C" fn munmap_hook(address: *mut c_void, length: size_t) -> c_int {
    if address.is_null() {
        return libc::munmap(address, length);
    }
    let _guard = match ReentryGuard::enter() {
        Some(guard) => guard,
        None => return libc::munmap(address, length),
    };
    let taken = dispatch("munmap", |t| t.on_unmap(address as usize)).flatten();
    let result = libc::munmap(address, length);
    if result != 0 {
        if let Some(record) = taken {
            dispatch("munmap", |t| t.on_unmap_failed(record));
        }
    }
    result
}

/// A symbol to redirect and the trampoline that replaces it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookTarget {
    pub symbol: &'static str,
    pub replacement: usize,
}

/// Every symbol the engine intercepts.
pub fn targets() -> [HookTarget; 8] {
    [
        HookTarget {
            symbol: "malloc",
            replacement: malloc_hook as usize,
        },
        HookTarget {
            symbol: "calloc",
            replacement: calloc_hook as usize,
        },
        HookTarget {
            symbol: "realloc",
            replacement: realloc_hook as usize,
        },
        HookTarget {
            symbol: "memalign",
            replacement: memalign_hook as usize,
        },
        HookTarget {
            symbol: "free",
            replacement: free_hook as usize,
        },
        HookTarget {
            symbol: "mmap",
            replacement: mmap_hook as usize,
        },
        HookTarget {
            symbol: "mmap64",
            replacement: mmap_hook as usize,
        },
        HookTarget {
            symbol: "munmap",
            replacement: munmap_hook as usize,
        },
    ]
}

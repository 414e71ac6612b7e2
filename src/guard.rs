//! Per-thread reentrancy flag.
//!
//! Any allocation performed while the flag is set (stack capture, ledger bookkeeping, report
//! rendering, logging) goes straight to the original allocator.

use std::cell::Cell;

thread_local! {
    // Const-initialised: reading it must not allocate.
    static NESTED: Cell<bool> = const { Cell::new(false) };
}

/// Holds the flag for the current thread until dropped.
#[derive(Debug)]
pub struct ReentryGuard {
    _private: (),
}

impl ReentryGuard {
    /// Set the flag.  Returns `None` if this thread is already inside the engine, or if the
    /// thread-local has been destroyed (allocation during thread teardown).
    pub fn enter() -> Option<Self> {
        NESTED
            .try_with(|nested| {
                if nested.get() {
                    None
                } else {
                    nested.set(true);
                    Some(ReentryGuard { _private: () })
                }
            })
            .ok()
            .flatten()
    }

    pub fn is_nested() -> bool {
        // Thread teardown counts as nested.
        NESTED.try_with(|nested| nested.get()).unwrap_or(true)
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = NESTED.try_with(|nested| nested.set(false));
    }
}

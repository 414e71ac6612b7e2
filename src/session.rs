//! Start/stop/print state machine.
//!
//! A [`Session`] is `Stopped` or `Running`.  Transitions go through the transient `Starting`
//! and `Stopping` states with a compare-and-swap, so of two racing `start` calls exactly one
//! proceeds and the other gets [`Error::AlreadyRunning`] without side effects.  Hooks are
//! installed and removed under the control mutex.
//!
//! The trampolines dispatch to one process-wide tracker, so at most one session may be
//! running in a process at a time.

use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    config::{Config, EngineOptions},
    error::{Error, Result},
    filter::LibraryFilter,
    guard::ReentryGuard,
    hook::{targets, trampoline, HookBackend, HookInstaller},
    report::ReportDocument,
    snapshot::{Snapshot, SnapshotDiff},
    tracker::Tracker,
};

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl State {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STARTING => State::Starting,
            RUNNING => State::Running,
            STOPPING => State::Stopping,
            _ => State::Stopped,
        }
    }
}

struct Control<B: HookBackend> {
    installer: HookInstaller<B>,
    tracker: Option<Arc<Tracker>>,
}

pub struct Session<B: HookBackend> {
    state: AtomicU8,
    options: EngineOptions,
    control: Mutex<Control<B>>,
}

impl<B: HookBackend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self::with_options(backend, EngineOptions::default())
    }

    pub fn with_options(backend: B, options: EngineOptions) -> Self {
        Session {
            state: AtomicU8::new(STOPPED),
            options,
            control: Mutex::new(Control {
                installer: HookInstaller::new(backend),
                tracker: None,
            }),
        }
    }

    pub fn state(&self) -> State {
        State::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    fn lock(&self) -> MutexGuard<'_, Control<B>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inspect the hook backend (tests and diagnostics).
    pub fn with_backend<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(self.lock().installer.backend())
    }

    /// Decode `configs`, prepare the storage directory, build a tracker and install hooks
    /// into every library whose base name matches `regex` (all libraries when absent).
    ///
    /// On failure nothing stays installed and the session is `Stopped` again.
    pub fn start(&self, configs: u32, space: Option<&Path>, regex: Option<&str>) -> Result<()> {
        self.state
            .compare_exchange(STOPPED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::AlreadyRunning)?;
        let _guard = ReentryGuard::enter();
        match self.install(configs, space, regex) {
            Ok(()) => {
                self.state.store(RUNNING, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("start failed: {}", e);
                self.state.store(STOPPED, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn install(&self, configs: u32, space: Option<&Path>, regex: Option<&str>) -> Result<()> {
        let config = Config::from_bits(configs);
        let filter = LibraryFilter::new(regex)?;
        let space = match space {
            Some(path) => match fs::create_dir_all(path) {
                Ok(()) => Some(path),
                Err(source) if config.large_map => {
                    return Err(Error::InvalidStorage {
                        path: path.to_path_buf(),
                        source,
                    })
                }
                Err(e) => {
                    tracing::warn!("no report artifacts, cannot use {}: {}", path.display(), e);
                    None
                }
            },
            None if config.large_map => return Err(Error::MissingStorage),
            None => None,
        };
        if !config.records_anything() {
            tracing::warn!("neither allocator nor map tracking enabled, nothing will be recorded");
        }

        let tracker = Arc::new(Tracker::new(config, self.options.clone(), space)?);
        let mut control = self.lock();
        trampoline::attach(&tracker);
        match control.installer.install(&filter, &targets()) {
            Ok(summary) => {
                tracing::info!(
                    "started ({}): {} slots in {} libraries, {} imports absent",
                    config,
                    summary.slots,
                    summary.libraries,
                    summary.missing.len()
                );
                control.tracker = Some(tracker);
                Ok(())
            }
            Err(e) => {
                trampoline::detach();
                Err(e)
            }
        }
    }

    /// Restore every hooked slot, emit a final report and release the ledger.
    pub fn stop(&self) -> Result<()> {
        self.state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::NotRunning)?;
        let _guard = ReentryGuard::enter();
        let mut control = self.lock();
        let restored = control.installer.uninstall();
        trampoline::detach();
        if let Some(tracker) = control.tracker.take() {
            tracker.print();
        }
        drop(control);
        self.state.store(STOPPED, Ordering::SeqCst);
        tracing::info!("stopped, {} slots restored", restored);
        Ok(())
    }

    fn tracker(&self) -> Result<Arc<Tracker>> {
        if !self.is_running() {
            return Err(Error::NotStarted);
        }
        self.lock().tracker.clone().ok_or(Error::NotStarted)
    }

    /// Log the current report and write report artifacts.
    pub fn print(&self) -> Result<()> {
        let _guard = ReentryGuard::enter();
        self.tracker()?.print();
        Ok(())
    }

    /// Current report without logging or artifacts.
    pub fn report(&self) -> Result<ReportDocument> {
        let _guard = ReentryGuard::enter();
        Ok(self.tracker()?.report())
    }

    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let _guard = ReentryGuard::enter();
        Ok(self.tracker()?.snapshot())
    }

    /// Delta since the previously retained snapshot.  Requires the diff cache.
    pub fn diff(&self) -> Result<Option<SnapshotDiff>> {
        let _guard = ReentryGuard::enter();
        self.tracker()?.diff()
    }
}

impl<B: HookBackend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::{
        config::{ALLOC_MODE, DIFF_CACHE, MAP64_MODE},
        hook::fake::FakeBackend,
    };

    fn session() -> Session<FakeBackend> {
        let backend = FakeBackend::default().with_library("/system/lib/libfoo.so", &["malloc", "free"]);
        Session::with_options(
            backend,
            EngineOptions {
                ledger_capacity: 1024,
                shards: 4,
                ..Default::default()
            },
        )
    }

    #[test]
    #[serial]
    fn start_stop_idempotence() {
        let session = session();
        assert!(matches!(session.print(), Err(Error::NotStarted)));
        assert!(matches!(session.stop(), Err(Error::NotRunning)));
        session.start(ALLOC_MODE, None, None).unwrap();
        assert_eq!(session.state(), State::Running);
        assert!(matches!(session.start(ALLOC_MODE, None, None), Err(Error::AlreadyRunning)));
        session.print().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), State::Stopped);
        assert!(!trampoline::is_attached());
        assert!(matches!(session.stop(), Err(Error::NotRunning)));
    }

    #[test]
    #[serial]
    fn bad_filter_leaves_session_stopped() {
        let session = session();
        let err = session.start(ALLOC_MODE, None, Some("lib(")).unwrap_err();
        assert!(matches!(err, Error::InvalidFilter { .. }));
        assert_eq!(session.state(), State::Stopped);
        assert!(!trampoline::is_attached());
    }

    #[test]
    #[serial]
    fn large_map_requires_storage() {
        let session = session();
        assert!(matches!(
            session.start(MAP64_MODE, None, None),
            Err(Error::MissingStorage)
        ));
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        session.start(MAP64_MODE, Some(&nested), None).unwrap();
        assert!(nested.is_dir());
        session.stop().unwrap();
    }

    #[test]
    #[serial]
    fn hooks_feed_the_running_tracker() {
        let session = session();
        session.start(ALLOC_MODE | DIFF_CACHE, None, None).unwrap();
        assert_eq!(session.diff().unwrap(), None);
        // SAFETY: plain malloc/free pairs.
        unsafe {
            let p = trampoline::malloc_hook(4096);
            assert!(session.snapshot().unwrap().total_bytes >= 4096);
            trampoline::free_hook(p);
        }
        let delta = session.diff().unwrap().unwrap();
        assert_eq!(delta.total.bytes, 0);
        session.stop().unwrap();
        assert!(matches!(session.snapshot(), Err(Error::NotStarted)));
    }
}

//! The recording engine behind one running session.
//!
//! A [`Tracker`] owns the stack table, the ledger and the retained snapshot.  Trampolines
//! feed it through the `on_*` methods with the reentrancy guard already held; control
//! operations take the guard themselves so that their own allocations are not recorded.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    arena::Arena,
    config::{Config, EngineOptions},
    error::{Error, Result},
    guard::ReentryGuard,
    hook::trampoline,
    ledger::{AllocKind, AllocationRecord, Ledger, LedgerLayout},
    maps,
    report::{Report, ReportDocument, SystemResolver, REPORT_FILE},
    snapshot::{Snapshot, SnapshotCache, SnapshotDiff},
    stack::{self, StackTable},
};

/// Name of the maps artifact in the storage directory.
pub const MAPS_FILE: &str = "maps";

pub struct Tracker {
    config: Config,
    options: EngineOptions,
    space: Option<PathBuf>,
    ledger: Ledger,
    cache: SnapshotCache,
    // Trampoline addresses; captured stacks start at the caller of the innermost one.
    entry_points: [usize; 8],
}

impl Tracker {
    /// Build an idle tracker.  In large-map mode the ledger arena is created in `space`,
    /// which is then required.
    pub fn new(config: Config, options: EngineOptions, space: Option<&Path>) -> Result<Self> {
        let _guard = ReentryGuard::enter();
        let layout = LedgerLayout::new(options.ledger_capacity, options.shards);
        let arena = if config.large_map {
            let space = space.ok_or(Error::MissingStorage)?;
            Arena::file(space, layout.arena_bytes()).map_err(|source| Error::InvalidStorage {
                path: space.to_path_buf(),
                source,
            })?
        } else {
            Arena::heap(layout.arena_bytes())
        };
        tracing::debug!(
            "ledger: {} records in {} shards, {} arena bytes{}",
            layout.capacity(),
            options.shards,
            layout.arena_bytes(),
            arena
                .path()
                .map(|p| format!(" at {}", p.display()))
                .unwrap_or_default()
        );
        let ledger = Ledger::new(arena, layout, Arc::new(StackTable::new()));
        Ok(Tracker {
            config,
            options,
            space: space.map(Path::to_path_buf),
            ledger,
            cache: SnapshotCache::new(config.diff_cache),
            entry_points: trampoline::targets().map(|target| target.replacement),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn space(&self) -> Option<&Path> {
        self.space.as_deref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn stacks(&self) -> &StackTable {
        self.ledger.stacks()
    }

    #[inline(never)]
    fn record(&self, address: usize, size: usize, kind: AllocKind) {
        let frames = stack::capture(
            self.config.max_depth,
            &self.entry_points,
            self.options.skip_frames,
        );
        let id = self.stacks().intern(&frames);
        self.ledger.on_allocate(address, size, kind, id);
    }

    /// `malloc`, `calloc` and `memalign` returned `address`.
    pub fn on_heap_alloc(&self, address: usize, size: usize) {
        if self.config.alloc_hooks && size >= self.config.min_size {
            self.record(address, size, AllocKind::Heap);
        }
    }

    /// `realloc(old, ..)` is about to run.  The record of `old` leaves the ledger before the
    /// allocator can hand the address to another thread; pass it to [`Tracker::on_heap_realloc`].
    pub fn before_heap_realloc(&self, old: usize) -> Option<AllocationRecord> {
        if self.config.alloc_hooks && old != 0 {
            self.ledger.on_free(old)
        } else {
            None
        }
    }

    /// `realloc(_, size)` returned `new`.  `taken` is what [`Tracker::before_heap_realloc`]
    /// removed.
    pub fn on_heap_realloc(&self, taken: Option<AllocationRecord>, new: usize, size: usize) {
        if !self.config.alloc_hooks {
            return;
        }
        if new == 0 {
            // A failed realloc leaves the old block allocated, unless it was a free in disguise.
            if size != 0 {
                if let Some(record) = taken {
                    self.ledger.reinstate(record);
                }
            }
            return;
        }
        if size >= self.config.min_size {
            self.record(new, size, AllocKind::Heap);
        }
    }

    pub fn on_heap_free(&self, address: usize) {
        if self.config.alloc_hooks {
            self.ledger.on_free(address);
        }
    }

    pub fn on_map(&self, address: usize, length: usize) {
        if self.config.large_map {
            self.record(address, length, AllocKind::Map);
        }
    }

    /// `munmap(address, ..)` is about to run.  Returns the removed record so that a failed
    /// unmap can put it back through [`Tracker::on_unmap_failed`].
    pub fn on_unmap(&self, address: usize) -> Option<AllocationRecord> {
        if self.config.large_map {
            self.ledger.on_free(address)
        } else {
            None
        }
    }

    pub fn on_unmap_failed(&self, taken: AllocationRecord) {
        if self.config.large_map {
            self.ledger.reinstate(taken);
        }
    }

    /// Aggregate the ledger without touching the retained snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let _guard = ReentryGuard::enter();
        Arc::new(self.ledger.snapshot())
    }

    /// Capture a snapshot, retain it and return its delta against the one it replaces.
    pub fn diff(&self) -> Result<Option<SnapshotDiff>> {
        let _guard = ReentryGuard::enter();
        if !self.cache.is_enabled() {
            return Err(Error::DiffDisabled);
        }
        self.cache.exchange(Arc::new(self.ledger.snapshot()))
    }

    /// Build the current report.  With the diff cache on this also retains the new snapshot.
    pub fn report(&self) -> ReportDocument {
        let _guard = ReentryGuard::enter();
        let snapshot = Arc::new(self.ledger.snapshot());
        let counters = self.ledger.counters();
        let mut resolver = SystemResolver::new();
        let delta = if self.cache.is_enabled() {
            match self.cache.exchange(snapshot.clone()) {
                Ok(Some(diff)) => Some(Report::delta(&diff, self.stacks(), counters, &mut resolver)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("no delta: {}", e);
                    None
                }
            }
        } else {
            None
        };
        ReportDocument {
            pid: std::process::id(),
            config: self.config.to_bits(),
            live: Report::live(&snapshot, self.stacks(), counters, &mut resolver),
            delta,
        }
    }

    /// Log the current report and, with a storage directory, replace the report artifacts.
    /// Artifact failures are logged only.
    pub fn print(&self) -> ReportDocument {
        let _guard = ReentryGuard::enter();
        let document = self.report();
        for line in document.lines() {
            tracing::info!(target: "malloc_attrib::report", "{}", line);
        }
        if let Some(space) = &self.space {
            if let Err(e) = write_artifacts(space, &document) {
                tracing::warn!("failed to write report to {}: {}", space.display(), e);
            }
        }
        document
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        let _guard = ReentryGuard::enter();
        self.cache.clear();
        tracing::debug!(
            "releasing ledger ({} stacks, {} live records)",
            self.stacks().len(),
            self.ledger.len()
        );
    }
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn write_artifacts(space: &Path, document: &ReportDocument) -> Result<()> {
    let report = space.join(REPORT_FILE);
    let maps = space.join(MAPS_FILE);
    remove_stale(&report)?;
    remove_stale(&maps)?;
    let mut writer = BufWriter::new(File::create(&report)?);
    serde_yaml::to_writer(&mut writer, document)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
    writer.flush()?;
    maps::dump_self(&maps)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::ARENA_FILE, config};

    fn options() -> EngineOptions {
        EngineOptions {
            ledger_capacity: 4096,
            shards: 4,
            ..Default::default()
        }
    }

    fn heap_tracker(bits: u32) -> Tracker {
        Tracker::new(Config::from_bits(bits), options(), None).unwrap()
    }

    const HEAP: u32 = config::ALLOC_MODE | 0x0004_0000;

    #[test]
    fn records_and_frees_heap_allocations() {
        let tracker = heap_tracker(HEAP);
        tracker.on_heap_alloc(0x1000, 100);
        tracker.on_heap_alloc(0x2000, 50);
        assert_eq!(tracker.ledger().totals(), (150, 2));
        tracker.on_heap_free(0x1000);
        assert_eq!(tracker.ledger().totals(), (50, 1));
        let record = tracker.ledger().get(0x2000).unwrap();
        assert_eq!(record.kind, AllocKind::Heap);
        assert!(!tracker.stacks().frames(record.stack).unwrap().is_empty());
    }

    #[test]
    fn small_allocations_are_skipped_but_frees_looked_up() {
        let tracker = heap_tracker(HEAP | 64);
        tracker.on_heap_alloc(0x1000, 63);
        tracker.on_heap_alloc(0x2000, 64);
        assert_eq!(tracker.ledger().len(), 1);
        tracker.on_heap_free(0x1000);
        assert_eq!(tracker.ledger().counters().unmatched_frees, 1);
    }

    fn realloc(tracker: &Tracker, old: usize, new: usize, size: usize) {
        let taken = tracker.before_heap_realloc(old);
        tracker.on_heap_realloc(taken, new, size);
    }

    #[test]
    fn realloc_moves_record() {
        let tracker = heap_tracker(HEAP);
        tracker.on_heap_alloc(0x1000, 16);
        realloc(&tracker, 0x1000, 0x2000, 32);
        assert!(tracker.ledger().get(0x1000).is_none());
        assert_eq!(tracker.ledger().get(0x2000).unwrap().size, 32);

        // Failed realloc keeps the old block, as it was.
        let before = tracker.ledger().get(0x2000).unwrap();
        realloc(&tracker, 0x2000, 0, 1 << 40);
        assert_eq!(tracker.ledger().get(0x2000), Some(before));

        // realloc(p, 0) frees.
        realloc(&tracker, 0x2000, 0, 0);
        assert!(tracker.ledger().is_empty());
    }

    #[test]
    fn realloc_forgets_old_block_before_it_is_reissued() {
        let tracker = heap_tracker(HEAP);
        tracker.on_heap_alloc(0x1000, 16);
        let taken = tracker.before_heap_realloc(0x1000);
        assert_eq!(taken.unwrap().size, 16);
        // The allocator frees 0x1000 inside realloc and another thread gets it back.
        tracker.on_heap_alloc(0x1000, 32);
        tracker.on_heap_realloc(taken, 0x2000, 64);

        assert_eq!(tracker.ledger().get(0x1000).unwrap().size, 32);
        assert_eq!(tracker.ledger().get(0x2000).unwrap().size, 64);
        assert_eq!(tracker.ledger().totals(), (96, 2));
        assert_eq!(tracker.ledger().counters().reconciled, 0);
    }

    #[test]
    fn failed_unmap_keeps_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_bits(config::MAP64_MODE);
        let tracker = Tracker::new(config, options(), Some(dir.path())).unwrap();
        tracker.on_map(0x7000_0000, 1 << 20);
        let before = tracker.ledger().get(0x7000_0000).unwrap();
        let taken = tracker.on_unmap(0x7000_0000).unwrap();
        assert!(tracker.ledger().is_empty());
        tracker.on_unmap_failed(taken);
        assert_eq!(tracker.ledger().get(0x7000_0000), Some(before));
    }

    #[test]
    fn disabled_kinds_are_ignored() {
        let tracker = heap_tracker(HEAP);
        tracker.on_map(0x7000_0000, 4096);
        assert!(tracker.ledger().is_empty());

        let tracker = heap_tracker(0);
        tracker.on_heap_alloc(0x1000, 100);
        assert!(tracker.ledger().is_empty());
    }

    #[test]
    fn large_map_needs_storage() {
        let config = Config::from_bits(config::MAP64_MODE);
        assert!(matches!(
            Tracker::new(config, options(), None),
            Err(Error::MissingStorage)
        ));
    }

    #[test]
    fn large_map_uses_file_arena_and_tracks_maps() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_bits(config::MAP64_MODE);
        let tracker = Tracker::new(config, options(), Some(dir.path())).unwrap();
        assert!(tracker.ledger().arena().is_file_backed());
        assert!(dir.path().join(ARENA_FILE).exists());
        tracker.on_map(0x7000_0000, 1 << 20);
        assert_eq!(tracker.ledger().get(0x7000_0000).unwrap().kind, AllocKind::Map);
        tracker.on_unmap(0x7000_0000);
        assert!(tracker.ledger().is_empty());
        drop(tracker);
        assert!(!dir.path().join(ARENA_FILE).exists());
    }

    #[test]
    fn diff_requires_cache() {
        let tracker = heap_tracker(HEAP);
        assert!(matches!(tracker.diff(), Err(Error::DiffDisabled)));

        let tracker = heap_tracker(HEAP | config::DIFF_CACHE);
        assert_eq!(tracker.diff().unwrap(), None);
        tracker.on_heap_alloc(0x1000, 40);
        let delta = tracker.diff().unwrap().unwrap();
        assert_eq!(delta.total.bytes, 40);
        assert_eq!(delta.stacks.len(), 1);
    }

    #[test]
    fn report_ranks_and_carries_delta() {
        let tracker = heap_tracker(HEAP | config::DIFF_CACHE);
        tracker.on_heap_alloc(0x1000, 10);
        let first = tracker.report();
        assert!(first.delta.is_none());
        assert_eq!(first.live.total_bytes, 10);
        assert_eq!(first.config, tracker.config().to_bits());

        tracker.on_heap_alloc(0x2000, 20);
        let second = tracker.report();
        let delta = second.delta.unwrap();
        assert_eq!(delta.total_bytes, 20);
        assert_eq!(second.live.rows[0].rank, 1);
        assert!(second.live.rows.iter().all(|row| row.stack < 2));
    }

    #[test]
    fn print_replaces_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_bits(HEAP);
        let tracker = Tracker::new(config, options(), Some(dir.path())).unwrap();
        fs::write(dir.path().join(REPORT_FILE), "stale").unwrap();
        tracker.on_heap_alloc(0x1000, 128);
        let printed = tracker.print();

        let text = fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap();
        let loaded: ReportDocument = serde_yaml::from_str(&text).unwrap();
        assert_eq!(loaded, printed);
        assert_eq!(loaded.live.total_bytes, 128);
        let maps = fs::read_to_string(dir.path().join(MAPS_FILE)).unwrap();
        assert!(!maps.is_empty());
    }
}

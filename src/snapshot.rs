//! Point-in-time aggregates of the ledger and deltas between them.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    stack::StackId,
};

/// Outstanding bytes and allocation count of one call stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTotals {
    pub bytes: u64,
    pub count: u64,
}

impl StackTotals {
    pub fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.count += 1;
    }
}

/// Immutable aggregate of the ledger taken at a single cut point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Ledger allocation sequence number at the cut: every allocation with a lower sequence
    /// number that was still live is included, nothing after it is.
    pub sequence: u64,
    pub stacks: BTreeMap<StackId, StackTotals>,
    pub total_bytes: u64,
    pub total_count: u64,
}

impl Snapshot {
    pub fn from_records<I>(sequence: u64, records: I) -> Self
    where
        I: IntoIterator<Item = (StackId, u64)>,
    {
        let mut snapshot = Snapshot {
            sequence,
            ..Default::default()
        };
        for (stack, bytes) in records {
            snapshot.stacks.entry(stack).or_default().add(bytes);
            snapshot.total_bytes += bytes;
            snapshot.total_count += 1;
        }
        snapshot
    }

    pub fn get(&self, stack: StackId) -> StackTotals {
        self.stacks.get(&stack).copied().unwrap_or_default()
    }
}

/// Signed change of one stack's totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDelta {
    pub bytes: i64,
    pub count: i64,
}

impl StackDelta {
    fn between(before: StackTotals, after: StackTotals) -> Self {
        StackDelta {
            bytes: after.bytes as i64 - before.bytes as i64,
            count: after.count as i64 - before.count as i64,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == 0 && self.count == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub from: u64,
    pub to: u64,
    /// Stacks whose totals changed.  Unchanged stacks are omitted.
    pub stacks: BTreeMap<StackId, StackDelta>,
    pub total: StackDelta,
}

impl SnapshotDiff {
    pub fn get(&self, stack: StackId) -> StackDelta {
        self.stacks.get(&stack).copied().unwrap_or_default()
    }
}

/// Per-stack delta from `previous` to `current`.  A stack present on one side only is diffed
/// against zero.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let mut stacks = BTreeMap::new();
    let ids = previous.stacks.keys().chain(current.stacks.keys());
    for id in ids {
        if stacks.contains_key(id) {
            continue;
        }
        let delta = StackDelta::between(previous.get(*id), current.get(*id));
        if !delta.is_zero() {
            stacks.insert(*id, delta);
        }
    }
    SnapshotDiff {
        from: previous.sequence,
        to: current.sequence,
        stacks,
        total: StackDelta::between(
            StackTotals {
                bytes: previous.total_bytes,
                count: previous.total_count,
            },
            StackTotals {
                bytes: current.total_bytes,
                count: current.total_count,
            },
        ),
    }
}

/// Holds at most one previous snapshot for diffing.
#[derive(Debug)]
pub struct SnapshotCache {
    enabled: bool,
    retained: Mutex<Option<Arc<Snapshot>>>,
}

impl SnapshotCache {
    pub fn new(enabled: bool) -> Self {
        SnapshotCache {
            enabled,
            retained: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn retained(&self) -> Option<Arc<Snapshot>> {
        self.retained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Retain `current`, returning its diff against the snapshot it replaces (`None` on the
    /// first call).
    pub fn exchange(&self, current: Arc<Snapshot>) -> Result<Option<SnapshotDiff>> {
        if !self.enabled {
            return Err(Error::DiffDisabled);
        }
        let mut retained = self.retained.lock().unwrap_or_else(PoisonError::into_inner);
        let delta = retained.as_ref().map(|previous| diff(previous, &current));
        *retained = Some(current);
        Ok(delta)
    }

    pub fn clear(&self) {
        *self.retained.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const X: StackId = StackId(0);
    const Y: StackId = StackId(1);

    #[test]
    fn diff_reports_growth() {
        let s1 = Snapshot::from_records(1, vec![(X, 100)]);
        let s2 = Snapshot::from_records(3, vec![(X, 100), (X, 50), (X, 50)]);
        assert_eq!(s2.get(X).bytes, 200);
        let delta = diff(&s1, &s2);
        assert_eq!(delta.get(X), StackDelta { bytes: 100, count: 2 });
        assert_eq!(delta.total, StackDelta { bytes: 100, count: 2 });
        assert_eq!((delta.from, delta.to), (1, 3));
    }

    #[test]
    fn one_sided_stacks_diff_against_zero() {
        let s1 = Snapshot::from_records(1, vec![(X, 64)]);
        let s2 = Snapshot::from_records(2, vec![(Y, 32), (Y, 32)]);
        let delta = diff(&s1, &s2);
        assert_eq!(delta.get(X), StackDelta { bytes: -64, count: -1 });
        assert_eq!(delta.get(Y), StackDelta { bytes: 64, count: 2 });
    }

    #[test]
    fn unchanged_stacks_are_omitted() {
        let s1 = Snapshot::from_records(1, vec![(X, 8), (Y, 8)]);
        let s2 = Snapshot::from_records(2, vec![(X, 8), (Y, 16)]);
        let delta = diff(&s1, &s2);
        assert!(!delta.stacks.contains_key(&X));
        assert!(delta.stacks.contains_key(&Y));
    }

    #[test]
    fn cache_keeps_one_snapshot() {
        let cache = SnapshotCache::new(true);
        let first = Arc::new(Snapshot::from_records(1, vec![(X, 10)]));
        assert_eq!(cache.exchange(first).unwrap(), None);
        let second = Arc::new(Snapshot::from_records(2, vec![(X, 10), (X, 5)]));
        let delta = cache.exchange(second.clone()).unwrap().unwrap();
        assert_eq!(delta.get(X).bytes, 5);
        assert_eq!(cache.retained(), Some(second));
    }

    #[test]
    fn disabled_cache_refuses_diff() {
        let cache = SnapshotCache::new(false);
        let snapshot = Arc::new(Snapshot::default());
        assert!(matches!(cache.exchange(snapshot), Err(Error::DiffDisabled)));
        assert!(cache.retained().is_none());
    }
}

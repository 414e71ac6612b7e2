//! Live allocation records keyed by address.
//!
//! The ledger is a fixed-capacity, sharded, chained hash table laid out entirely inside an
//! [`Arena`].  Each shard owns a disjoint run of record slots plus its bucket array and is
//! protected by its own mutex, so:
//!
//! * operations on the same address always serialize on the same shard lock;
//! * operations on different addresses only contend if they hash to the same shard;
//! * a snapshot takes every shard lock in index order, which gives one consistent cut.
//!
//! Inserting, removing and reconciling records never allocates.

use std::{
    mem,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::{
    arena::Arena,
    snapshot::Snapshot,
    stack::{StackId, StackTable},
};

const NIL: u32 = u32::MAX;

/// What kind of call produced a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocKind {
    Heap,
    Map,
}

impl AllocKind {
    fn to_raw(self) -> u32 {
        match self {
            AllocKind::Heap => 0,
            AllocKind::Map => 1,
        }
    }

    fn from_raw(raw: u32) -> Self {
        if raw == 1 {
            AllocKind::Map
        } else {
            AllocKind::Heap
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: usize,
    pub size: usize,
    pub stack: StackId,
    pub sequence: u64,
    pub thread: u64,
    pub kind: AllocKind,
}

/// Result of [`Ledger::on_allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    /// The address already had a live record (its free was never observed).  The stale
    /// record is returned after being evicted.
    Replaced(AllocationRecord),
    /// The shard is full; nothing was recorded.
    Dropped,
}

/// Reconciliation counters.  Never errors: missed interceptions are expected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounters {
    /// Allocations that found a stale live record at their address.
    pub reconciled: u64,
    /// Frees of addresses with no live record.
    pub unmatched_frees: u64,
    /// Allocations not recorded because the arena was full.
    pub dropped: u64,
}

// In-arena representation of a record.
#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    address: usize,
    size: usize,
    sequence: u64,
    thread: u64,
    stack: u32,
    kind: u32,
    next: u32,
    _pad: u32,
}

impl Slot {
    fn record(&self) -> AllocationRecord {
        AllocationRecord {
            address: self.address,
            size: self.size,
            stack: StackId(self.stack),
            sequence: self.sequence,
            thread: self.thread,
            kind: AllocKind::from_raw(self.kind),
        }
    }

    fn fill(&mut self, record: &AllocationRecord) {
        self.address = record.address;
        self.size = record.size;
        self.sequence = record.sequence;
        self.thread = record.thread;
        self.stack = record.stack.0;
        self.kind = record.kind.to_raw();
    }
}

// One shard: `capacity` slots and `bucket_mask + 1` bucket heads, both inside the arena.
struct ShardTable {
    slots: NonNull<Slot>,
    capacity: u32,
    buckets: NonNull<u32>,
    bucket_mask: u32,
    // Recycled slots, linked through `Slot::next`.
    free: u32,
    // Slots `unused..capacity` have never been handed out.
    unused: u32,
    live: u32,
    bytes: u64,
}

// SAFETY: a ShardTable exclusively owns its region of the arena and is only reachable through
// its mutex.
unsafe impl Send for ShardTable {}

impl ShardTable {
    /// # Safety
    ///
    /// `slots` must be valid for `capacity` slots and `buckets` for `bucket_count` u32s, both
    /// properly aligned, not aliased by anything else, and outliving the table.
    unsafe fn new(slots: *mut Slot, capacity: u32, buckets: *mut u32, bucket_count: u32) -> Self {
        debug_assert!(bucket_count.is_power_of_two());
        for b in 0..bucket_count as usize {
            buckets.add(b).write(NIL);
        }
        ShardTable {
            slots: NonNull::new_unchecked(slots),
            capacity,
            buckets: NonNull::new_unchecked(buckets),
            bucket_mask: bucket_count - 1,
            free: NIL,
            unused: 0,
            live: 0,
            bytes: 0,
        }
    }

    fn slot(&self, idx: u32) -> &Slot {
        debug_assert!(idx < self.capacity);
        // SAFETY: idx < capacity, see `new`.
        unsafe { &*self.slots.as_ptr().add(idx as usize) }
    }

    fn slot_mut(&mut self, idx: u32) -> &mut Slot {
        debug_assert!(idx < self.capacity);
        // SAFETY: idx < capacity and `&mut self` is exclusive.
        unsafe { &mut *self.slots.as_ptr().add(idx as usize) }
    }

    fn head(&self, bucket: u32) -> u32 {
        // SAFETY: bucket is masked by the caller.
        unsafe { *self.buckets.as_ptr().add(bucket as usize) }
    }

    fn set_head(&mut self, bucket: u32, idx: u32) {
        // SAFETY: bucket is masked by the caller and `&mut self` is exclusive.
        unsafe { *self.buckets.as_ptr().add(bucket as usize) = idx }
    }

    // Returns `(predecessor, index)` of the slot holding `address`.
    fn find(&self, bucket: u32, address: usize) -> Option<(u32, u32)> {
        let mut prev = NIL;
        let mut idx = self.head(bucket);
        while idx != NIL {
            let slot = self.slot(idx);
            if slot.address == address {
                return Some((prev, idx));
            }
            prev = idx;
            idx = slot.next;
        }
        None
    }

    fn take_slot(&mut self) -> Option<u32> {
        if self.free != NIL {
            let idx = self.free;
            self.free = self.slot(idx).next;
            Some(idx)
        } else if self.unused < self.capacity {
            let idx = self.unused;
            self.unused += 1;
            Some(idx)
        } else {
            None
        }
    }

    fn insert(&mut self, bucket: u32, record: &AllocationRecord) -> Insert {
        let bucket = bucket & self.bucket_mask;
        if let Some((_, idx)) = self.find(bucket, record.address) {
            let stale = self.slot(idx).record();
            self.slot_mut(idx).fill(record);
            self.bytes = self.bytes - stale.size as u64 + record.size as u64;
            return Insert::Replaced(stale);
        }
        let idx = match self.take_slot() {
            Some(idx) => idx,
            None => return Insert::Dropped,
        };
        let head = self.head(bucket);
        let slot = self.slot_mut(idx);
        slot.fill(record);
        slot.next = head;
        self.set_head(bucket, idx);
        self.live += 1;
        self.bytes += record.size as u64;
        Insert::Inserted
    }

    fn remove(&mut self, bucket: u32, address: usize) -> Option<AllocationRecord> {
        let bucket = bucket & self.bucket_mask;
        let (prev, idx) = self.find(bucket, address)?;
        let record = self.slot(idx).record();
        let next = self.slot(idx).next;
        if prev == NIL {
            self.set_head(bucket, next);
        } else {
            self.slot_mut(prev).next = next;
        }
        let free = self.free;
        self.slot_mut(idx).next = free;
        self.free = idx;
        self.live -= 1;
        self.bytes -= record.size as u64;
        Some(record)
    }

    fn get(&self, bucket: u32, address: usize) -> Option<AllocationRecord> {
        let bucket = bucket & self.bucket_mask;
        self.find(bucket, address)
            .map(|(_, idx)| self.slot(idx).record())
    }

    fn for_each<F: FnMut(&Slot)>(&self, mut f: F) {
        for bucket in 0..=self.bucket_mask {
            let mut idx = self.head(bucket);
            while idx != NIL {
                let slot = self.slot(idx);
                f(slot);
                idx = slot.next;
            }
        }
    }
}

/// Shape of the arena a ledger needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerLayout {
    pub shards: usize,
    pub slots_per_shard: usize,
    pub buckets_per_shard: usize,
}

impl LedgerLayout {
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        let slots_per_shard = ((capacity.max(1) + shards - 1) / shards).min(NIL as usize - 1);
        LedgerLayout {
            shards,
            slots_per_shard,
            buckets_per_shard: slots_per_shard.next_power_of_two(),
        }
    }

    fn shard_stride(&self) -> usize {
        let bytes = self.slots_per_shard * mem::size_of::<Slot>()
            + self.buckets_per_shard * mem::size_of::<u32>();
        (bytes + 7) & !7
    }

    /// Arena payload size in bytes.
    pub fn arena_bytes(&self) -> usize {
        self.shards * self.shard_stride()
    }

    pub fn capacity(&self) -> usize {
        self.shards * self.slots_per_shard
    }
}

pub struct Ledger {
    shards: Box<[CachePadded<Mutex<ShardTable>>]>,
    shard_bits: u32,
    stacks: Arc<StackTable>,
    sequence: AtomicU64,
    reconciled: AtomicU64,
    unmatched_frees: AtomicU64,
    dropped: AtomicU64,
    layout: LedgerLayout,
    // Declared last: the shard tables point into it.
    arena: Arena,
}

impl Ledger {
    /// Lay out a ledger inside `arena`, which must hold at least `layout.arena_bytes()`.
    pub fn new(mut arena: Arena, layout: LedgerLayout, stacks: Arc<StackTable>) -> Self {
        assert!(
            arena.payload_len() >= layout.arena_bytes(),
            "arena too small for ledger layout"
        );
        let base = arena.payload_ptr();
        let stride = layout.shard_stride();
        let slots_bytes = layout.slots_per_shard * mem::size_of::<Slot>();
        let shards = (0..layout.shards)
            .map(|i| {
                // SAFETY: shard regions are disjoint, in bounds (checked above) and 8-byte
                // aligned: the payload is 8-aligned, `stride` is a multiple of 8 and Slot is
                // a multiple of 8 bytes.
                let table = unsafe {
                    let region = base.add(i * stride);
                    ShardTable::new(
                        region as *mut Slot,
                        layout.slots_per_shard as u32,
                        region.add(slots_bytes) as *mut u32,
                        layout.buckets_per_shard as u32,
                    )
                };
                CachePadded::new(Mutex::new(table))
            })
            .collect();
        Ledger {
            shards,
            shard_bits: layout.shards.trailing_zeros(),
            stacks,
            sequence: AtomicU64::new(0),
            reconciled: AtomicU64::new(0),
            unmatched_frees: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            layout,
            arena,
        }
    }

    /// Ledger over an ordinary heap buffer.
    pub fn on_heap(capacity: usize, shards: usize, stacks: Arc<StackTable>) -> Self {
        let layout = LedgerLayout::new(capacity, shards);
        Self::new(Arena::heap(layout.arena_bytes()), layout, stacks)
    }

    pub fn layout(&self) -> LedgerLayout {
        self.layout
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn stacks(&self) -> &Arc<StackTable> {
        &self.stacks
    }

    // Fibonacci hashing; allocator addresses are at least 8-aligned so the low bits carry no
    // information.
    fn locate(&self, address: usize) -> (usize, u32) {
        let hash = ((address as u64) >> 3).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let shard = if self.shard_bits == 0 {
            0
        } else {
            (hash >> (64 - self.shard_bits)) as usize
        };
        // Bucket bits come from the middle of the product; its low bits only depend on the
        // low bits of the address.
        (shard, (hash >> 24) as u32)
    }

    fn lock(&self, shard: usize) -> MutexGuard<'_, ShardTable> {
        self.shards[shard]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a live allocation at `address` attributed to `stack`.
    pub fn on_allocate(&self, address: usize, size: usize, kind: AllocKind, stack: StackId) -> Insert {
        let (shard, bucket) = self.locate(address);
        // Retained before the record becomes visible, released after a record disappears, so
        // every visible record is backed by a reference.
        self.stacks.retain(stack);
        let outcome = {
            let mut table = self.lock(shard);
            let record = AllocationRecord {
                address,
                size,
                stack,
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                thread: current_thread(),
                kind,
            };
            table.insert(bucket, &record)
        };
        match outcome {
            Insert::Inserted => {}
            Insert::Replaced(stale) => {
                self.reconciled.fetch_add(1, Ordering::Relaxed);
                self.stacks.release(stale.stack);
                tracing::debug!(
                    "stale record at {:#x} ({} bytes) replaced by {} bytes",
                    address,
                    stale.size,
                    size
                );
            }
            Insert::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.stacks.release(stack);
            }
        }
        outcome
    }

    /// Forget the allocation at `address`.  Returns its record, or `None` (counted as an
    /// unmatched free) if there was none.
    pub fn on_free(&self, address: usize) -> Option<AllocationRecord> {
        let (shard, bucket) = self.locate(address);
        let removed = self.lock(shard).remove(bucket, address);
        match removed {
            Some(record) => self.stacks.release(record.stack),
            None => {
                self.unmatched_frees.fetch_add(1, Ordering::Relaxed);
            }
        }
        removed
    }

    /// Put back a record taken out by [`Ledger::on_free`] when the release it anticipated
    /// failed.  The record keeps its stack, sequence and thread.  Returns `false` without
    /// touching the ledger if the address went live again in the meantime.
    pub fn reinstate(&self, record: AllocationRecord) -> bool {
        let (shard, bucket) = self.locate(record.address);
        self.stacks.retain(record.stack);
        let outcome = {
            let mut table = self.lock(shard);
            if table.get(bucket, record.address).is_some() {
                None
            } else {
                Some(table.insert(bucket, &record))
            }
        };
        match outcome {
            Some(Insert::Inserted) => true,
            Some(Insert::Replaced(stale)) => {
                self.stacks.release(stale.stack);
                true
            }
            Some(Insert::Dropped) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.stacks.release(record.stack);
                false
            }
            None => {
                self.stacks.release(record.stack);
                false
            }
        }
    }

    pub fn get(&self, address: usize) -> Option<AllocationRecord> {
        let (shard, bucket) = self.locate(address);
        self.lock(shard).get(bucket, address)
    }

    fn lock_all(&self) -> Vec<MutexGuard<'_, ShardTable>> {
        // Always in index order.
        (0..self.shards.len()).map(|i| self.lock(i)).collect()
    }

    /// Aggregate every live record at one cut point.
    pub fn snapshot(&self) -> Snapshot {
        let tables = self.lock_all();
        let sequence = self.sequence.load(Ordering::Relaxed);
        let mut records = Vec::new();
        for table in &tables {
            table.for_each(|slot| records.push((StackId(slot.stack), slot.size as u64)));
        }
        drop(tables);
        Snapshot::from_records(sequence, records)
    }

    /// All live records, taken at one cut point and sorted by address.
    pub fn records(&self) -> Vec<AllocationRecord> {
        let tables = self.lock_all();
        let mut records = Vec::new();
        for table in &tables {
            table.for_each(|slot| records.push(slot.record()));
        }
        drop(tables);
        records.sort_by_key(|record| record.address);
        records
    }

    /// `(total bytes, live records)` at one cut point.
    pub fn totals(&self) -> (u64, u64) {
        self.lock_all()
            .iter()
            .fold((0, 0), |(bytes, count), table| {
                (bytes + table.bytes, count + table.live as u64)
            })
    }

    pub fn total_bytes(&self) -> u64 {
        self.totals().0
    }

    pub fn len(&self) -> usize {
        self.totals().1 as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> LedgerCounters {
        LedgerCounters {
            reconciled: self.reconciled.load(Ordering::Relaxed),
            unmatched_frees: self.unmatched_frees.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

fn current_thread() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Frames;

    fn ledger(capacity: usize, shards: usize) -> (Ledger, StackId, StackId) {
        let stacks = Arc::new(StackTable::new());
        let x = stacks.intern(&Frames::from_slice(&[0x10, 0x20]));
        let y = stacks.intern(&Frames::from_slice(&[0x30]));
        (Ledger::on_heap(capacity, shards, stacks), x, y)
    }

    #[test]
    fn allocate_and_free() {
        let (ledger, x, _) = ledger(64, 4);
        assert_eq!(ledger.on_allocate(0x1000, 10, AllocKind::Heap, x), Insert::Inserted);
        assert_eq!(ledger.on_allocate(0x2000, 30, AllocKind::Map, x), Insert::Inserted);
        assert_eq!(ledger.total_bytes(), 40);
        assert_eq!(ledger.stacks().live(x), 2);

        let freed = ledger.on_free(0x1000).unwrap();
        assert_eq!(freed.size, 10);
        assert_eq!(freed.stack, x);
        assert_eq!(freed.kind, AllocKind::Heap);
        assert_eq!(ledger.total_bytes(), 30);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.stacks().live(x), 1);
        assert_eq!(ledger.get(0x2000).unwrap().kind, AllocKind::Map);
    }

    #[test]
    fn address_reuse_is_reconciled() {
        let (ledger, x, y) = ledger(64, 4);
        ledger.on_allocate(0xA0, 10, AllocKind::Heap, x);
        match ledger.on_allocate(0xA0, 20, AllocKind::Heap, y) {
            Insert::Replaced(stale) => assert_eq!(stale.size, 10),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.total_bytes(), 20);
        assert_eq!(ledger.get(0xA0).unwrap().size, 20);
        assert_eq!(ledger.counters().reconciled, 1);
        assert_eq!(ledger.stacks().live(x), 0);
        assert_eq!(ledger.stacks().live(y), 1);
    }

    #[test]
    fn unmatched_free_changes_nothing() {
        let (ledger, x, _) = ledger(64, 4);
        ledger.on_allocate(0xA0, 10, AllocKind::Heap, x);
        let before = ledger.records();
        assert_eq!(ledger.on_free(0xB0), None);
        assert_eq!(ledger.records(), before);
        assert_eq!(ledger.counters().unmatched_frees, 1);
        assert_eq!(ledger.total_bytes(), 10);
    }

    #[test]
    fn full_shard_drops() {
        let (ledger, x, _) = ledger(1, 1);
        assert_eq!(ledger.layout().capacity(), 1);
        assert_eq!(ledger.on_allocate(0x10, 1, AllocKind::Heap, x), Insert::Inserted);
        assert_eq!(ledger.on_allocate(0x20, 1, AllocKind::Heap, x), Insert::Dropped);
        assert_eq!(ledger.counters().dropped, 1);
        assert_eq!(ledger.stacks().live(x), 1);
        // Freed slots are recycled.
        ledger.on_free(0x10);
        assert_eq!(ledger.on_allocate(0x20, 1, AllocKind::Heap, x), Insert::Inserted);
        assert_eq!(ledger.records()[0].address, 0x20);
    }

    #[test]
    fn reinstated_record_keeps_identity() {
        let (ledger, x, y) = ledger(64, 4);
        ledger.on_allocate(0x10, 8, AllocKind::Heap, y);
        ledger.on_allocate(0xA0, 10, AllocKind::Heap, x);
        let taken = ledger.on_free(0xA0).unwrap();
        assert_eq!(ledger.stacks().live(x), 0);

        assert!(ledger.reinstate(taken));
        assert_eq!(ledger.get(0xA0), Some(taken));
        assert_eq!(ledger.get(0xA0).unwrap().sequence, 1);
        assert_eq!(ledger.stacks().live(x), 1);
        assert_eq!(ledger.totals(), (18, 2));

        // A newer record at the same address wins.
        let taken = ledger.on_free(0xA0).unwrap();
        ledger.on_allocate(0xA0, 32, AllocKind::Heap, y);
        assert!(!ledger.reinstate(taken));
        assert_eq!(ledger.get(0xA0).unwrap().size, 32);
        assert_eq!(ledger.stacks().live(x), 0);
        assert_eq!(ledger.stacks().live(y), 2);
        assert_eq!(ledger.counters().reconciled, 0);
    }

    #[test]
    fn colliding_buckets_unlink_correctly() {
        // One shard with one bucket forces every record into the same chain.
        let stacks = Arc::new(StackTable::new());
        let x = stacks.intern(&Frames::from_slice(&[1]));
        let layout = LedgerLayout {
            shards: 1,
            slots_per_shard: 8,
            buckets_per_shard: 1,
        };
        let ledger = Ledger::new(Arena::heap(layout.arena_bytes()), layout, stacks);
        for i in 1..=5 {
            ledger.on_allocate(i * 16, i, AllocKind::Heap, x);
        }
        ledger.on_free(48);
        ledger.on_free(80);
        ledger.on_free(16);
        let left: Vec<_> = ledger.records().iter().map(|r| r.address).collect();
        assert_eq!(left, vec![32, 64]);
        assert_eq!(ledger.total_bytes(), 2 + 4);
    }

    #[test]
    fn snapshot_aggregates_per_stack() {
        let (ledger, x, y) = ledger(64, 8);
        ledger.on_allocate(0x100, 60, AllocKind::Heap, x);
        ledger.on_allocate(0x200, 40, AllocKind::Heap, x);
        ledger.on_allocate(0x300, 150, AllocKind::Heap, y);
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.sequence, 3);
        assert_eq!(snapshot.get(x).bytes, 100);
        assert_eq!(snapshot.get(x).count, 2);
        assert_eq!(snapshot.get(y).bytes, 150);
        assert_eq!(snapshot.total_bytes, 250);
        assert_eq!(snapshot.total_count, 3);
    }

    #[test]
    fn file_backed_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let stacks = Arc::new(StackTable::new());
        let x = stacks.intern(&Frames::from_slice(&[1]));
        let layout = LedgerLayout::new(1024, 4);
        let arena = Arena::file(dir.path(), layout.arena_bytes()).unwrap();
        let ledger = Ledger::new(arena, layout, stacks);
        assert!(ledger.arena().is_file_backed());
        for i in 0..100 {
            ledger.on_allocate(0x1000 + i * 8, 8, AllocKind::Heap, x);
        }
        assert_eq!(ledger.total_bytes(), 800);
    }
}

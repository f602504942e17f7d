//! The shared global transaction table.
//!
//! [`TxnGlobal`] owns everything sessions coordinate through: the id
//! counters, the global timestamps, the slot array, the update store, and
//! the two locks. The ordering invariant maintained here is
//!
//! ```text
//! metadata_pinned <= oldest_id <= last_running <= current
//! ```
//!
//! `current` is the next id to hand out; the other three trail it and only
//! ever move forward.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use bramble_types::{Timestamp, TxnId};

use crate::slot::{SlotArray, TxnSlot};
use crate::stats::{SlotDump, TxnStats, TxnStatsSnapshot, TxnTableDump};
use crate::updates::UpdateStore;

// ---------------------------------------------------------------------------
// TxnGlobal
// ---------------------------------------------------------------------------

/// Global transaction state shared by every session.
pub struct TxnGlobal {
    /// Next transaction id to allocate.
    current: AtomicU64,
    /// Smallest id that could have been running at the last oldest scan.
    last_running: AtomicU64,
    /// Ids below this are resolved for every tracked snapshot.
    oldest_id: AtomicU64,
    /// Floor for checkpoint-metadata readers; trails `oldest_id`.
    metadata_pinned: AtomicU64,

    durable_timestamp: AtomicU64,
    has_durable_timestamp: AtomicBool,
    oldest_timestamp: AtomicU64,
    has_oldest_timestamp: AtomicBool,
    pinned_timestamp: AtomicU64,
    has_pinned_timestamp: AtomicBool,
    stable_timestamp: AtomicU64,
    has_stable_timestamp: AtomicBool,

    /// Id of the running checkpoint's transaction. 0 = none.
    checkpoint_id: AtomicU64,
    /// Oldest id pinned by a named snapshot. 0 = none.
    nsnap_oldest_id: AtomicU64,
    /// Bumped by every read-write commit; lets snapshot requests skip the
    /// slot walk when nothing has resolved since the last one.
    commit_generation: AtomicU64,
    /// Table-wide default for whether commit flushes the log.
    default_sync: AtomicBool,

    /// Scan lock. Read-held by snapshot allocation and the read-only
    /// oldest scan; write-held while publishing new oldest values.
    pub(crate) scan_lock: RwLock<()>,
    /// Serializes multi-field global timestamp updates.
    pub(crate) ts_lock: RwLock<()>,

    pub(crate) slots: SlotArray,
    pub(crate) updates: UpdateStore,
    pub(crate) stats: TxnStats,
}

impl TxnGlobal {
    /// Create a table with `capacity` session slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let first = TxnId::FIRST.get();
        Self {
            current: AtomicU64::new(first),
            last_running: AtomicU64::new(first),
            oldest_id: AtomicU64::new(first),
            metadata_pinned: AtomicU64::new(first),
            durable_timestamp: AtomicU64::new(0),
            has_durable_timestamp: AtomicBool::new(false),
            oldest_timestamp: AtomicU64::new(0),
            has_oldest_timestamp: AtomicBool::new(false),
            pinned_timestamp: AtomicU64::new(0),
            has_pinned_timestamp: AtomicBool::new(false),
            stable_timestamp: AtomicU64::new(0),
            has_stable_timestamp: AtomicBool::new(false),
            checkpoint_id: AtomicU64::new(0),
            nsnap_oldest_id: AtomicU64::new(0),
            commit_generation: AtomicU64::new(0),
            default_sync: AtomicBool::new(true),
            scan_lock: RwLock::new(()),
            ts_lock: RwLock::new(()),
            slots: SlotArray::new(capacity),
            updates: UpdateStore::new(),
            stats: TxnStats::new(),
        }
    }

    // -- id counters --

    /// Next id to be allocated.
    #[inline]
    #[must_use]
    pub fn current(&self) -> TxnId {
        TxnId::new(self.current.load(Ordering::Acquire))
    }

    /// Published last-running id.
    #[inline]
    #[must_use]
    pub fn last_running(&self) -> TxnId {
        TxnId::new(self.last_running.load(Ordering::Acquire))
    }

    /// Published oldest id.
    #[inline]
    #[must_use]
    pub fn oldest_id(&self) -> TxnId {
        TxnId::new(self.oldest_id.load(Ordering::Acquire))
    }

    /// Published metadata-pinned id.
    #[inline]
    #[must_use]
    pub fn metadata_pinned(&self) -> TxnId {
        TxnId::new(self.metadata_pinned.load(Ordering::Acquire))
    }

    pub(crate) fn store_oldest_values(
        &self,
        oldest_id: TxnId,
        last_running: TxnId,
        metadata_pinned: TxnId,
    ) {
        if self.metadata_pinned() < metadata_pinned {
            self.metadata_pinned
                .store(metadata_pinned.get(), Ordering::Release);
        }
        if self.oldest_id() < oldest_id {
            self.oldest_id.store(oldest_id.get(), Ordering::Release);
        }
        if self.last_running() < last_running {
            self.last_running.store(last_running.get(), Ordering::Release);
        }
        let (meta, oldest, last) = (self.metadata_pinned(), self.oldest_id(), self.last_running());
        assert!(
            meta <= oldest && oldest <= last,
            "transaction table id ordering violated: metadata_pinned {meta} oldest {oldest} last_running {last}"
        );
    }

    /// Allocate a transaction id and publish it in `slot`.
    ///
    /// The slot first publishes `is_allocating` and the current global id
    /// as a provisional value, then atomically claims the real id and
    /// republishes it. Scans that catch the provisional window spin until
    /// `is_allocating` clears, so no allocated id can slip under a
    /// concurrently built snapshot.
    pub(crate) fn allocate_id(&self, slot: &TxnSlot) -> TxnId {
        slot.is_allocating.store(true, Ordering::Release);
        slot.id
            .store(self.current.load(Ordering::Acquire), Ordering::Release);
        let id = self.current.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            id != TxnId::ABORTED.get(),
            "transaction id space exhausted"
        );
        slot.id.store(id, Ordering::Release);
        slot.is_allocating.store(false, Ordering::Release);
        TxnId::new(id)
    }

    // -- commit generation --

    /// Current commit generation.
    #[inline]
    #[must_use]
    pub fn commit_generation(&self) -> u64 {
        self.commit_generation.load(Ordering::Acquire)
    }

    /// Advance the commit generation. Called by read-write commits after
    /// their slot id is cleared.
    pub(crate) fn bump_commit_generation(&self) -> u64 {
        self.commit_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    // -- global timestamps --

    #[must_use]
    pub(crate) fn load_timestamp(
        &self,
        value: &AtomicU64,
        has: &AtomicBool,
    ) -> Option<Timestamp> {
        if has.load(Ordering::Acquire) {
            Some(Timestamp::new(value.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Global durable timestamp, if one has been established.
    #[must_use]
    pub fn durable_timestamp(&self) -> Option<Timestamp> {
        self.load_timestamp(&self.durable_timestamp, &self.has_durable_timestamp)
    }

    /// Global oldest timestamp, if set.
    #[must_use]
    pub fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.load_timestamp(&self.oldest_timestamp, &self.has_oldest_timestamp)
    }

    /// Global pinned timestamp, if established.
    #[must_use]
    pub fn pinned_timestamp(&self) -> Option<Timestamp> {
        self.load_timestamp(&self.pinned_timestamp, &self.has_pinned_timestamp)
    }

    /// Global stable timestamp, if set.
    #[must_use]
    pub fn stable_timestamp(&self) -> Option<Timestamp> {
        self.load_timestamp(&self.stable_timestamp, &self.has_stable_timestamp)
    }

    pub(crate) fn store_durable_timestamp(&self, ts: Timestamp) {
        self.durable_timestamp.store(ts.get(), Ordering::Release);
        self.has_durable_timestamp.store(true, Ordering::Release);
    }

    pub(crate) fn store_oldest_timestamp(&self, ts: Timestamp) {
        self.oldest_timestamp.store(ts.get(), Ordering::Release);
        self.has_oldest_timestamp.store(true, Ordering::Release);
    }

    pub(crate) fn store_pinned_timestamp(&self, ts: Timestamp) {
        self.pinned_timestamp.store(ts.get(), Ordering::Release);
        self.has_pinned_timestamp.store(true, Ordering::Release);
    }

    pub(crate) fn store_stable_timestamp(&self, ts: Timestamp) {
        self.stable_timestamp.store(ts.get(), Ordering::Release);
        self.has_stable_timestamp.store(true, Ordering::Release);
    }

    /// Raise the global durable timestamp to `candidate` if it is ahead.
    ///
    /// Lock-free maximum: concurrent committers race, the largest value
    /// wins, and the timestamp never moves backwards.
    pub(crate) fn update_durable_timestamp(&self, candidate: Timestamp) {
        if candidate.is_none() {
            return;
        }
        let mut prev = self.durable_timestamp.load(Ordering::Acquire);
        while candidate.get() > prev {
            match self.durable_timestamp.compare_exchange_weak(
                prev,
                candidate.get(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => {
                    TxnStats::bump(&self.stats.durable_ts_cas_retries_total);
                    prev = observed;
                }
            }
        }
        self.has_durable_timestamp.store(true, Ordering::Release);
    }

    // -- checkpoint and named-snapshot hooks --

    /// Id of the running checkpoint transaction, if any.
    #[must_use]
    pub fn checkpoint_id(&self) -> TxnId {
        TxnId::new(self.checkpoint_id.load(Ordering::Acquire))
    }

    /// Register `id` as the running checkpoint transaction.
    ///
    /// # Panics
    ///
    /// Panics if a checkpoint is already registered.
    pub fn set_checkpoint_id(&self, id: TxnId) {
        let prev = self.checkpoint_id.swap(id.get(), Ordering::AcqRel);
        assert_eq!(
            prev, 0,
            "checkpoint already running with id {prev}; cannot register {id}"
        );
        debug!(checkpoint = %id, "checkpoint transaction registered");
    }

    /// Deregister the running checkpoint transaction.
    pub fn clear_checkpoint_id(&self) {
        self.checkpoint_id.store(0, Ordering::Release);
    }

    /// Oldest id pinned by a named snapshot, if any.
    #[must_use]
    pub fn named_snapshot_floor(&self) -> TxnId {
        TxnId::new(self.nsnap_oldest_id.load(Ordering::Acquire))
    }

    /// Pin (or with `TxnId::NONE`, release) the named-snapshot floor.
    pub fn set_named_snapshot_floor(&self, id: TxnId) {
        self.nsnap_oldest_id.store(id.get(), Ordering::Release);
    }

    // -- sync default --

    /// Whether commit flushes the log by default.
    #[must_use]
    pub fn default_sync(&self) -> bool {
        self.default_sync.load(Ordering::Acquire)
    }

    /// Change the table-wide sync default.
    pub fn set_default_sync(&self, sync: bool) {
        self.default_sync.store(sync, Ordering::Release);
    }

    // -- activity --

    /// Whether any slot publishes a running or allocating transaction.
    #[must_use]
    pub fn any_active(&self) -> bool {
        self.slots.iter().any(|slot| {
            slot.has_running_txn(Ordering::Acquire) || slot.is_allocating.load(Ordering::Acquire)
        })
    }

    /// Spin until no transaction is running. Yields between probes.
    pub fn activity_drain(&self) {
        while self.any_active() {
            std::thread::yield_now();
        }
    }

    /// Whether any slot publishes a running id below `id`, ignoring slots
    /// still allocating.
    ///
    /// Used to decide whether a transaction is itself the oldest blocker:
    /// if nothing older runs, it is.
    #[must_use]
    pub fn any_running_id_below(&self, id: TxnId) -> bool {
        self.slots.iter().any(|slot| {
            if slot.is_allocating.load(Ordering::Acquire) {
                return false;
            }
            let running = slot.running_id(Ordering::Acquire);
            !running.is_none() && running < id
        })
    }

    /// Whether any slot pins a snapshot minimum below `snap_min`.
    #[must_use]
    pub fn any_pinned_id_below(&self, snap_min: TxnId) -> bool {
        self.slots.iter().any(|slot| {
            let pinned = TxnId::new(slot.pinned_id.load(Ordering::Acquire));
            !pinned.is_none() && pinned < snap_min
        })
    }

    // -- diagnostics --

    /// Counter snapshot.
    #[must_use]
    pub fn stats_snapshot(&self) -> TxnStatsSnapshot {
        self.stats.snapshot()
    }

    /// Unlocked verbose dump of the table and every slot.
    #[must_use]
    pub fn dump(&self) -> TxnTableDump {
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotDump {
                index,
                id: slot.running_id(Ordering::Acquire),
                pinned_id: TxnId::new(slot.pinned_id.load(Ordering::Acquire)),
                metadata_pinned: TxnId::new(slot.metadata_pinned.load(Ordering::Acquire)),
                read_timestamp: Timestamp::new(slot.read_timestamp.load(Ordering::Acquire)),
                is_allocating: slot.is_allocating.load(Ordering::Acquire),
            })
            .collect();
        TxnTableDump {
            current: self.current(),
            last_running: self.last_running(),
            oldest_id: self.oldest_id(),
            metadata_pinned: self.metadata_pinned(),
            durable_timestamp: self.durable_timestamp().unwrap_or(Timestamp::NONE),
            has_durable_timestamp: self.has_durable_timestamp.load(Ordering::Acquire),
            oldest_timestamp: self.oldest_timestamp().unwrap_or(Timestamp::NONE),
            has_oldest_timestamp: self.has_oldest_timestamp.load(Ordering::Acquire),
            pinned_timestamp: self.pinned_timestamp().unwrap_or(Timestamp::NONE),
            has_pinned_timestamp: self.has_pinned_timestamp.load(Ordering::Acquire),
            stable_timestamp: self.stable_timestamp().unwrap_or(Timestamp::NONE),
            has_stable_timestamp: self.has_stable_timestamp.load(Ordering::Acquire),
            checkpoint_id: self.checkpoint_id(),
            commit_generation: self.commit_generation(),
            slots,
        }
    }
}

impl std::fmt::Debug for TxnGlobal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnGlobal")
            .field("current", &self.current())
            .field("last_running", &self.last_running())
            .field("oldest_id", &self.oldest_id())
            .field("metadata_pinned", &self.metadata_pinned())
            .field("commit_generation", &self.commit_generation())
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn fresh_table_ids_all_first() {
        let global = TxnGlobal::new(4);
        assert_eq!(global.current(), TxnId::FIRST);
        assert_eq!(global.last_running(), TxnId::FIRST);
        assert_eq!(global.oldest_id(), TxnId::FIRST);
        assert_eq!(global.metadata_pinned(), TxnId::FIRST);
        assert_eq!(global.commit_generation(), 0);
        assert!(global.durable_timestamp().is_none());
        assert!(!global.any_active());
    }

    #[test]
    fn allocate_publishes_then_clears_allocating() {
        let global = TxnGlobal::new(1);
        let idx = global.slots.claim().unwrap();
        let slot = global.slots.get(idx);
        let id = global.allocate_id(slot);
        assert_eq!(id, TxnId::FIRST);
        assert_eq!(slot.running_id(Ordering::Acquire), id);
        assert!(!slot.is_allocating.load(Ordering::Acquire));
        assert_eq!(global.current(), id.next());
    }

    #[test]
    fn concurrent_allocation_yields_distinct_consecutive_ids() {
        const THREADS: usize = 32;
        let global = Arc::new(TxnGlobal::new(THREADS));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let global = Arc::clone(&global);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let idx = global.slots.claim().expect("slot per thread");
                    barrier.wait();
                    let id = global.allocate_id(global.slots.get(idx));
                    global.slots.get(idx).clear_all();
                    global.slots.unclaim(idx);
                    id.get()
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        let expected: Vec<u64> = (1..=THREADS as u64).collect();
        assert_eq!(ids, expected, "ids are distinct and gapless");
        assert_eq!(global.current().get(), THREADS as u64 + 1);
    }

    #[test]
    fn durable_timestamp_is_a_running_maximum() {
        let global = TxnGlobal::new(1);
        global.update_durable_timestamp(Timestamp::new(10));
        assert_eq!(global.durable_timestamp(), Some(Timestamp::new(10)));
        // A smaller candidate never lowers it.
        global.update_durable_timestamp(Timestamp::new(3));
        assert_eq!(global.durable_timestamp(), Some(Timestamp::new(10)));
        global.update_durable_timestamp(Timestamp::new(12));
        assert_eq!(global.durable_timestamp(), Some(Timestamp::new(12)));
        // Zero candidates are ignored entirely.
        global.update_durable_timestamp(Timestamp::NONE);
        assert_eq!(global.durable_timestamp(), Some(Timestamp::new(12)));
    }

    #[test]
    fn concurrent_durable_updates_keep_the_maximum() {
        let global = Arc::new(TxnGlobal::new(1));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (1..=8u64)
            .map(|n| {
                let global = Arc::clone(&global);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for ts in (n..100).step_by(8) {
                        global.update_durable_timestamp(Timestamp::new(ts));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let max = (1u64..100).max().unwrap();
        assert_eq!(global.durable_timestamp(), Some(Timestamp::new(max)));
    }

    #[test]
    fn checkpoint_registration_is_exclusive() {
        let global = TxnGlobal::new(1);
        global.set_checkpoint_id(TxnId::new(5));
        assert_eq!(global.checkpoint_id(), TxnId::new(5));
        global.clear_checkpoint_id();
        assert_eq!(global.checkpoint_id(), TxnId::NONE);
        global.set_checkpoint_id(TxnId::new(7));
    }

    #[test]
    #[should_panic(expected = "checkpoint already running")]
    fn double_checkpoint_registration_panics() {
        let global = TxnGlobal::new(1);
        global.set_checkpoint_id(TxnId::new(5));
        global.set_checkpoint_id(TxnId::new(6));
    }

    #[test]
    fn advisory_helpers_scan_slots() {
        let global = TxnGlobal::new(3);
        let a = global.slots.claim().unwrap();
        global.slots.get(a).id.store(5, Ordering::Release);
        global.slots.get(a).pinned_id.store(4, Ordering::Release);

        assert!(global.any_running_id_below(TxnId::new(6)));
        assert!(!global.any_running_id_below(TxnId::new(5)));
        assert!(global.any_pinned_id_below(TxnId::new(5)));
        assert!(!global.any_pinned_id_below(TxnId::new(4)));

        // Slots mid-allocation are skipped for the running check.
        let b = global.slots.claim().unwrap();
        global.slots.get(b).id.store(2, Ordering::Release);
        global
            .slots
            .get(b)
            .is_allocating
            .store(true, Ordering::Release);
        assert!(!global.any_running_id_below(TxnId::new(4)));
    }

    #[test]
    fn store_oldest_values_never_regresses() {
        let global = TxnGlobal::new(1);
        global.store_oldest_values(TxnId::new(5), TxnId::new(6), TxnId::new(4));
        assert_eq!(global.oldest_id(), TxnId::new(5));
        assert_eq!(global.last_running(), TxnId::new(6));
        assert_eq!(global.metadata_pinned(), TxnId::new(4));

        // An older scan result cannot move anything backwards.
        global.store_oldest_values(TxnId::new(3), TxnId::new(3), TxnId::new(2));
        assert_eq!(global.oldest_id(), TxnId::new(5));
        assert_eq!(global.last_running(), TxnId::new(6));
        assert_eq!(global.metadata_pinned(), TxnId::new(4));
    }

    #[test]
    fn dump_reflects_slot_state() {
        let global = TxnGlobal::new(2);
        let idx = global.slots.claim().unwrap();
        let slot = global.slots.get(idx);
        global.allocate_id(slot);
        slot.pinned_id.store(1, Ordering::Release);

        let dump = global.dump();
        assert_eq!(dump.active_count(), 1);
        assert_eq!(dump.slots[idx].id, TxnId::FIRST);
        assert_eq!(dump.slots[idx].pinned_id, TxnId::FIRST);
        assert_eq!(dump.current, TxnId::new(2));
    }
}

//! Snapshot allocation: building a consistent read view from the slot
//! array.
//!
//! Allocation holds the scan lock in read mode, so any number of sessions
//! can build snapshots concurrently while oldest-id publication (which
//! takes the lock in write mode) is excluded. Slot reads themselves are
//! plain atomic loads; the only waiting is a bounded spin on slots caught
//! mid-id-allocation.

use std::sync::atomic::Ordering;

use bramble_types::{Snapshot, TxnId};

use crate::global::TxnGlobal;
use crate::stats::TxnStats;

impl TxnGlobal {
    /// Build a snapshot for the session owning slot `own_idx`.
    ///
    /// `own_id` is the session's allocated transaction id, or `NONE` for a
    /// read-only transaction. The walk collects every foreign id in
    /// `[oldest_id, current)`; ids below the oldest are already resolved
    /// for everyone and ids at or beyond `current` can never be visible to
    /// this view, so neither needs recording.
    ///
    /// Before returning, the session's `pinned_id` is published so oldest
    /// scans know what this snapshot holds open.
    pub(crate) fn take_snapshot(&self, own_idx: usize, own_id: TxnId) -> Snapshot {
        let own_slot = self.slots.get(own_idx);
        let generation = self.commit_generation();
        let guard = self.scan_lock.read();

        let current_id = self.current();
        let prev_oldest = self.oldest_id();
        let mut pinned_id = current_id;
        let mut active: Vec<TxnId> = Vec::new();

        // A running checkpoint's uncommitted metadata writes must stay
        // invisible, so its id always joins the view. It does not join the
        // pinned id: checkpoint changes need not be held open by us, only
        // accounted through the metadata pin.
        let checkpoint = self.checkpoint_id();
        if !checkpoint.is_none() {
            active.push(checkpoint);
            own_slot
                .metadata_pinned
                .store(checkpoint.get(), Ordering::Release);
        }

        // Read-only workloads: nothing between oldest and current means
        // nothing to scan.
        if prev_oldest == current_id {
            own_slot.pinned_id.store(current_id.get(), Ordering::Release);
            debug_assert_eq!(self.oldest_id(), prev_oldest);
            drop(guard);
            TxnStats::bump(&self.stats.snapshots_taken_total);
            return Snapshot::build(own_id, active, current_id, generation);
        }

        'slots: for (idx, slot) in self.slots.iter().enumerate() {
            if idx == own_idx {
                continue;
            }
            loop {
                let raw = slot.id.load(Ordering::Acquire);
                if raw == 0 || TxnId::new(raw) < prev_oldest {
                    continue 'slots;
                }
                if !slot.is_allocating.load(Ordering::Acquire) {
                    // We may have read the id inside the allocating window;
                    // it is only real if it re-reads unchanged now that the
                    // window is closed.
                    if slot.id.load(Ordering::Acquire) == raw {
                        let id = TxnId::new(raw);
                        if id == checkpoint {
                            // Already recorded above, and the checkpoint is
                            // held open through the metadata pin, not ours.
                            continue 'slots;
                        }
                        if id < current_id {
                            active.push(id);
                            if id < pinned_id {
                                pinned_id = id;
                            }
                        }
                        continue 'slots;
                    }
                }
                TxnStats::bump(&self.stats.snapshot_spins_total);
                std::hint::spin_loop();
            }
        }

        debug_assert!(prev_oldest <= pinned_id);
        debug_assert_eq!(self.oldest_id(), prev_oldest);
        own_slot.pinned_id.store(pinned_id.get(), Ordering::Release);
        drop(guard);

        TxnStats::bump(&self.stats.snapshots_taken_total);
        Snapshot::build(own_id, active, current_id, generation)
    }

    /// Drop the pins published by slot `own_idx`'s snapshot, along with
    /// the published read timestamp.
    ///
    /// A published pin must still be at or above the global oldest id when
    /// it is dropped; only read-uncommitted sessions, whose pins are
    /// published without the scan lock, may lag behind.
    pub(crate) fn release_snapshot_pin(&self, own_idx: usize, read_uncommitted: bool) {
        let slot = self.slots.get(own_idx);
        let pin = slot.pinned_id.load(Ordering::Acquire);
        debug_assert!(
            pin == 0 || read_uncommitted || TxnId::new(pin) >= self.oldest_id(),
            "released pin {pin} was already behind the oldest id"
        );
        slot.clear_pinned();
        slot.metadata_pinned.store(0, Ordering::Release);
        slot.read_timestamp.store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Oldest-id scanning and publication.
//!
//! The scan computes three trailing ids from the slot array: the smallest
//! published running id (`last_running`), the smallest snapshot pin
//! (`oldest_id`), and the smallest checkpoint-metadata pin
//! (`metadata_pinned`). Publication is two-phase: a read-locked scan
//! decides whether an update is worth it, then a write-locked re-scan
//! publishes, because the world keeps moving between the two locks.

use std::sync::atomic::Ordering;

use bramble_error::{BrambleError, Result};
use bramble_types::TxnId;
use tracing::info;

use crate::global::TxnGlobal;
use crate::stats::TxnStats;

/// Non-strict updates are deferred until the current id has pulled at
/// least this far ahead of the published oldest id.
const OLDEST_SCAN_SLACK: u64 = 100;

/// Pinned ranges wider than this get a log line naming the pinning slot.
const PINNED_RANGE_REPORT: u64 = 10_000;

/// Result of one pass over the slot array.
struct OldestScan {
    oldest_id: TxnId,
    last_running: TxnId,
    metadata_pinned: TxnId,
    /// Slot whose pin decided `oldest_id`, for diagnostics.
    oldest_slot: Option<usize>,
}

impl TxnGlobal {
    /// Scan every slot. Caller holds the scan lock (either mode).
    fn oldest_scan(&self) -> OldestScan {
        let prev_oldest = self.oldest_id();
        let current = self.current();
        let mut oldest_id = current;
        let mut last_running = current;
        let mut metadata_pinned = match self.checkpoint_id() {
            id if id.is_none() => current,
            id => id,
        };
        let mut oldest_slot = None;

        for (idx, slot) in self.slots.iter().enumerate() {
            // Track the smallest running id. Only ids that would actually
            // lower the result are worth the allocation-window spin.
            loop {
                let raw = slot.id.load(Ordering::Acquire);
                let id = TxnId::new(raw);
                if raw == 0 || id < prev_oldest || last_running <= id {
                    break;
                }
                if !slot.is_allocating.load(Ordering::Acquire) {
                    if slot.id.load(Ordering::Acquire) == raw {
                        last_running = id;
                        break;
                    }
                }
                std::hint::spin_loop();
            }

            let meta = TxnId::new(slot.metadata_pinned.load(Ordering::Acquire));
            if !meta.is_none() && meta < metadata_pinned {
                metadata_pinned = meta;
            }

            // Pins below the previous oldest id are NOT filtered out here:
            // read-uncommitted operations publish pins without holding the
            // scan lock, so a pin older than the last published oldest id
            // is legitimate and must keep its versions alive.
            let pinned = TxnId::new(slot.pinned_id.load(Ordering::Acquire));
            if !pinned.is_none() && pinned < oldest_id {
                oldest_id = pinned;
                oldest_slot = Some(idx);
            }
        }

        // Named snapshots hold the oldest id in place.
        let floor = self.named_snapshot_floor();
        if !floor.is_none() && floor < oldest_id {
            oldest_id = floor;
            oldest_slot = None;
        }

        if last_running < oldest_id {
            oldest_id = last_running;
            oldest_slot = None;
        }
        if oldest_id < metadata_pinned {
            metadata_pinned = oldest_id;
        }

        OldestScan {
            oldest_id,
            last_running,
            metadata_pinned,
            oldest_slot,
        }
    }

    /// Re-derive and publish the trailing ids.
    ///
    /// `strict` forces a full scan and publication even when the ids have
    /// barely moved; used by eviction-pressure paths that need the truth
    /// now. `wait` chooses between blocking on the scan lock and failing
    /// fast: with `wait` false, a held lock yields
    /// [`BrambleError::Busy`] instead of a silent no-op, so callers always
    /// learn their update did not happen.
    pub fn update_oldest(&self, strict: bool, wait: bool) -> Result<()> {
        let current = self.current();
        let prev_oldest = self.oldest_id();
        let prev_last_running = self.last_running();
        let prev_metadata = self.metadata_pinned();

        if strict {
            self.update_pinned_timestamp(false);
        }

        // Read-only workloads, or too little movement to justify a scan.
        if (prev_oldest == current && prev_metadata == current)
            || (!strict && current.get() < prev_oldest.get() + OLDEST_SCAN_SLACK)
        {
            TxnStats::bump(&self.stats.oldest_scan_skips_total);
            return Ok(());
        }

        // Phase one: read-locked scan to see whether publication is worth
        // the write lock.
        let guard = if wait {
            self.scan_lock.read()
        } else {
            match self.scan_lock.try_read() {
                Some(guard) => guard,
                None => {
                    TxnStats::bump(&self.stats.oldest_update_busy_total);
                    return Err(BrambleError::Busy);
                }
            }
        };
        TxnStats::bump(&self.stats.oldest_scans_total);
        let scan = self.oldest_scan();
        drop(guard);

        let oldest_stalled = scan.oldest_id == prev_oldest
            || (!strict && scan.oldest_id.get() < prev_oldest.get() + OLDEST_SCAN_SLACK);
        let last_running_stalled = scan.last_running == prev_last_running
            || (!strict && scan.last_running.get() < prev_last_running.get() + OLDEST_SCAN_SLACK);
        if oldest_stalled && last_running_stalled && scan.metadata_pinned == prev_metadata {
            TxnStats::bump(&self.stats.oldest_scan_skips_total);
            return Ok(());
        }

        // Phase two: publish under the write lock, re-scanning first; the
        // ids may have moved again while the lock was free.
        let guard = if wait {
            self.scan_lock.write()
        } else {
            match self.scan_lock.try_write() {
                Some(guard) => guard,
                None => {
                    TxnStats::bump(&self.stats.oldest_update_busy_total);
                    return Err(BrambleError::Busy);
                }
            }
        };
        TxnStats::bump(&self.stats.oldest_scans_total);
        let scan = self.oldest_scan();
        self.store_oldest_values(scan.oldest_id, scan.last_running, scan.metadata_pinned);

        if self.last_running() > prev_last_running {
            let pinned_range = current.get().saturating_sub(scan.oldest_id.get());
            if pinned_range > PINNED_RANGE_REPORT {
                if let Some(slot) = scan.oldest_slot {
                    info!(
                        oldest_id = %scan.oldest_id,
                        slot,
                        pinned_range,
                        "old snapshot is pinning the transaction table"
                    );
                }
            }
        }
        drop(guard);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

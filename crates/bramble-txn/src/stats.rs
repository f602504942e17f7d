//! Transaction-table statistics and the verbose state dump.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use bramble_types::{Timestamp, TxnId};

// ---------------------------------------------------------------------------
// TxnStats
// ---------------------------------------------------------------------------

/// Process-lifetime counters for the transaction table.
///
/// All counters are monotonic and updated with relaxed ordering; they are
/// diagnostics, not synchronization.
#[derive(Debug)]
pub struct TxnStats {
    /// Transactions begun.
    pub begins_total: AtomicU64,
    /// Transactions committed.
    pub commits_total: AtomicU64,
    /// Transactions rolled back.
    pub rollbacks_total: AtomicU64,
    /// Transactions prepared.
    pub prepares_total: AtomicU64,
    /// Snapshots allocated by a slot walk.
    pub snapshots_taken_total: AtomicU64,
    /// Snapshot requests satisfied from an unchanged commit generation.
    pub snapshot_generation_hits_total: AtomicU64,
    /// Spin iterations waiting out a slot in mid-allocation.
    pub snapshot_spins_total: AtomicU64,
    /// Full oldest-id scans performed.
    pub oldest_scans_total: AtomicU64,
    /// Oldest-id updates skipped because the id moved too little.
    pub oldest_scan_skips_total: AtomicU64,
    /// Oldest-id updates that returned busy instead of waiting.
    pub oldest_update_busy_total: AtomicU64,
    /// Reads that hit an unresolved prepared update.
    pub prepare_conflicts_total: AtomicU64,
    /// Retries of the global durable-timestamp maximum loop.
    pub durable_ts_cas_retries_total: AtomicU64,
}

impl TxnStats {
    /// Create a new stats instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            begins_total: AtomicU64::new(0),
            commits_total: AtomicU64::new(0),
            rollbacks_total: AtomicU64::new(0),
            prepares_total: AtomicU64::new(0),
            snapshots_taken_total: AtomicU64::new(0),
            snapshot_generation_hits_total: AtomicU64::new(0),
            snapshot_spins_total: AtomicU64::new(0),
            oldest_scans_total: AtomicU64::new(0),
            oldest_scan_skips_total: AtomicU64::new(0),
            oldest_update_busy_total: AtomicU64::new(0),
            prepare_conflicts_total: AtomicU64::new(0),
            durable_ts_cas_retries_total: AtomicU64::new(0),
        }
    }

    /// Bump a counter by one.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begins_total: self.begins_total.load(Ordering::Relaxed),
            commits_total: self.commits_total.load(Ordering::Relaxed),
            rollbacks_total: self.rollbacks_total.load(Ordering::Relaxed),
            prepares_total: self.prepares_total.load(Ordering::Relaxed),
            snapshots_taken_total: self.snapshots_taken_total.load(Ordering::Relaxed),
            snapshot_generation_hits_total: self
                .snapshot_generation_hits_total
                .load(Ordering::Relaxed),
            snapshot_spins_total: self.snapshot_spins_total.load(Ordering::Relaxed),
            oldest_scans_total: self.oldest_scans_total.load(Ordering::Relaxed),
            oldest_scan_skips_total: self.oldest_scan_skips_total.load(Ordering::Relaxed),
            oldest_update_busy_total: self.oldest_update_busy_total.load(Ordering::Relaxed),
            prepare_conflicts_total: self.prepare_conflicts_total.load(Ordering::Relaxed),
            durable_ts_cas_retries_total: self
                .durable_ts_cas_retries_total
                .load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero (tests/diagnostics).
    pub fn reset(&self) {
        self.begins_total.store(0, Ordering::Relaxed);
        self.commits_total.store(0, Ordering::Relaxed);
        self.rollbacks_total.store(0, Ordering::Relaxed);
        self.prepares_total.store(0, Ordering::Relaxed);
        self.snapshots_taken_total.store(0, Ordering::Relaxed);
        self.snapshot_generation_hits_total.store(0, Ordering::Relaxed);
        self.snapshot_spins_total.store(0, Ordering::Relaxed);
        self.oldest_scans_total.store(0, Ordering::Relaxed);
        self.oldest_scan_skips_total.store(0, Ordering::Relaxed);
        self.oldest_update_busy_total.store(0, Ordering::Relaxed);
        self.prepare_conflicts_total.store(0, Ordering::Relaxed);
        self.durable_ts_cas_retries_total.store(0, Ordering::Relaxed);
    }
}

impl Default for TxnStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of table counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxnStatsSnapshot {
    pub begins_total: u64,
    pub commits_total: u64,
    pub rollbacks_total: u64,
    pub prepares_total: u64,
    pub snapshots_taken_total: u64,
    pub snapshot_generation_hits_total: u64,
    pub snapshot_spins_total: u64,
    pub oldest_scans_total: u64,
    pub oldest_scan_skips_total: u64,
    pub oldest_update_busy_total: u64,
    pub prepare_conflicts_total: u64,
    pub durable_ts_cas_retries_total: u64,
}

impl std::fmt::Display for TxnStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "txn(begun={} committed={} rolled_back={} prepared={} snapshots={} gen_hits={})",
            self.begins_total,
            self.commits_total,
            self.rollbacks_total,
            self.prepares_total,
            self.snapshots_taken_total,
            self.snapshot_generation_hits_total,
        )
    }
}

// ---------------------------------------------------------------------------
// TxnTableDump
// ---------------------------------------------------------------------------

/// Verbose point-in-time dump of the global table and every slot.
///
/// The dump is unlocked and advisory: fields may be mutually inconsistent
/// while transactions run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxnTableDump {
    pub current: TxnId,
    pub last_running: TxnId,
    pub oldest_id: TxnId,
    pub metadata_pinned: TxnId,
    pub durable_timestamp: Timestamp,
    pub has_durable_timestamp: bool,
    pub oldest_timestamp: Timestamp,
    pub has_oldest_timestamp: bool,
    pub pinned_timestamp: Timestamp,
    pub has_pinned_timestamp: bool,
    pub stable_timestamp: Timestamp,
    pub has_stable_timestamp: bool,
    pub checkpoint_id: TxnId,
    pub commit_generation: u64,
    pub slots: Vec<SlotDump>,
}

/// One slot's published state within a [`TxnTableDump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotDump {
    pub index: usize,
    pub id: TxnId,
    pub pinned_id: TxnId,
    pub metadata_pinned: TxnId,
    pub read_timestamp: Timestamp,
    pub is_allocating: bool,
}

impl TxnTableDump {
    /// Number of slots with a published transaction id.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.id.is_none()).count()
    }

    /// Width of the pinned id range (`current - oldest_id`).
    #[must_use]
    pub fn pinned_range(&self) -> u64 {
        self.current.get().saturating_sub(self.oldest_id.get())
    }

    /// Width of the checkpoint pin (`current - checkpoint_id`), zero when
    /// no checkpoint is registered.
    #[must_use]
    pub fn checkpoint_range(&self) -> u64 {
        if self.checkpoint_id.is_none() {
            0
        } else {
            self.current.get().saturating_sub(self.checkpoint_id.get())
        }
    }
}

impl std::fmt::Display for TxnTableDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "transaction state dump")?;
        writeln!(f, "current ID: {}", self.current.get())?;
        writeln!(f, "last running ID: {}", self.last_running.get())?;
        writeln!(f, "oldest ID: {}", self.oldest_id.get())?;
        writeln!(f, "metadata pinned ID: {}", self.metadata_pinned.get())?;
        writeln!(
            f,
            "durable timestamp: {} (set: {})",
            self.durable_timestamp.get(),
            self.has_durable_timestamp
        )?;
        writeln!(
            f,
            "oldest timestamp: {} (set: {})",
            self.oldest_timestamp.get(),
            self.has_oldest_timestamp
        )?;
        writeln!(
            f,
            "pinned timestamp: {} (set: {})",
            self.pinned_timestamp.get(),
            self.has_pinned_timestamp
        )?;
        writeln!(
            f,
            "stable timestamp: {} (set: {})",
            self.stable_timestamp.get(),
            self.has_stable_timestamp
        )?;
        writeln!(f, "checkpoint ID: {}", self.checkpoint_id.get())?;
        writeln!(f, "commit generation: {}", self.commit_generation)?;
        writeln!(
            f,
            "active slots: {} of {}",
            self.active_count(),
            self.slots.len()
        )?;
        for slot in &self.slots {
            if slot.id.is_none() && slot.pinned_id.is_none() && slot.metadata_pinned.is_none() {
                continue;
            }
            writeln!(
                f,
                "slot {}: id {}, pinned id {}, metadata pinned {}, read ts {}{}",
                slot.index,
                slot.id.get(),
                slot.pinned_id.get(),
                slot.metadata_pinned.get(),
                slot.read_timestamp.get(),
                if slot.is_allocating {
                    " (allocating)"
                } else {
                    ""
                }
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Sessions and the transactions they run.
//!
//! A [`Session`] claims one slot in the shared table for its whole lifetime
//! and runs at most one transaction at a time. The transaction itself is
//! cheap state: an id that is only allocated on the first write, an optional
//! snapshot, and the list of updates published so far. Everything visible to
//! other sessions goes through the slot or the update store; nothing here is
//! shared directly.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::debug;

use bramble_error::{BrambleError, Result};
use bramble_types::{IsolationLevel, RecordKey, Snapshot, Timestamp, TxnId, UpdateKind};

use crate::config::TxnConfig;
use crate::global::TxnGlobal;
use crate::stats::TxnStats;
use crate::updates::{ReadView, UpdateIdx};

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One update published by a running transaction.
///
/// `repeated` and `reserved` are only set while preparing: they let the
/// resolve walk visit each key's chain once and skip reservations that were
/// already turned into tombstones.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Operation {
    pub(crate) key: RecordKey,
    pub(crate) update: UpdateIdx,
    /// History maintenance write. Becomes visible to everyone at commit
    /// rather than being stamped with the transaction's id.
    pub(crate) history: bool,
    pub(crate) repeated: bool,
    pub(crate) reserved: bool,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Per-transaction state, alive from `begin` to commit or rollback.
pub(crate) struct Transaction {
    /// `NONE` until the first write allocates a real id.
    pub(crate) id: TxnId,
    pub(crate) config: TxnConfig,
    /// Validated (and possibly rounded) copy of the configured read
    /// timestamp.
    pub(crate) read_timestamp: Option<Timestamp>,
    pub(crate) snapshot: Option<Snapshot>,
    /// Most transactions touch a handful of records; spill to the heap
    /// only past that.
    pub(crate) operations: SmallVec<[Operation; 8]>,
    /// Set by `prepare`; the only operations allowed afterward are commit
    /// and rollback.
    pub(crate) prepared: bool,
    pub(crate) prepare_timestamp: Option<Timestamp>,
    /// `ignore_prepare` forces the transaction read-only.
    pub(crate) read_only: bool,
    /// Whether `sync` was chosen at begin, so commit can reject a second
    /// choice.
    pub(crate) sync_set: bool,
    pub(crate) started_at: Instant,
    pub(crate) rollback_reason: Option<String>,
}

impl Transaction {
    fn new(config: TxnConfig) -> Self {
        let read_only = config.ignore_prepare;
        let sync_set = config.sync.is_set();
        Self {
            id: TxnId::NONE,
            config,
            read_timestamp: None,
            snapshot: None,
            operations: SmallVec::new(),
            prepared: false,
            prepare_timestamp: None,
            read_only,
            sync_set,
            started_at: Instant::now(),
            rollback_reason: None,
        }
    }

    /// Whether the operation timeout has elapsed since begin.
    pub(crate) fn op_timer_fired(&self) -> bool {
        self.config
            .operation_timeout_ms
            .map_or(false, |ms| self.started_at.elapsed() >= Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A handle on one table slot, running at most one transaction at a time.
///
/// Dropping a session rolls back any transaction still running and returns
/// the slot to the table.
pub struct Session {
    pub(crate) global: Arc<TxnGlobal>,
    pub(crate) slot_idx: usize,
    pub(crate) txn: Option<Transaction>,
    default_isolation: IsolationLevel,
}

impl Session {
    /// Claim a slot in `global`'s table.
    pub(crate) fn open(
        global: Arc<TxnGlobal>,
        default_isolation: IsolationLevel,
    ) -> Result<Self> {
        let Some(slot_idx) = global.slots.claim() else {
            return Err(BrambleError::SlotsExhausted {
                capacity: global.slots.capacity(),
            });
        };
        Ok(Self {
            global,
            slot_idx,
            txn: None,
            default_isolation,
        })
    }

    pub(crate) fn no_transaction() -> BrambleError {
        BrambleError::invalid_config("no transaction is running in this session")
    }

    pub(crate) fn prepared_guard() -> BrambleError {
        BrambleError::invalid_config("transaction is prepared; only commit or rollback may follow")
    }

    // -- lifecycle: begin --

    /// Start a transaction with this session's default isolation level.
    pub fn begin_default(&mut self) -> Result<()> {
        self.begin(TxnConfig {
            isolation: self.default_isolation,
            ..TxnConfig::default()
        })
    }

    /// Start a transaction.
    ///
    /// Validates the configuration, publishes the read timestamp if one was
    /// requested, and takes the snapshot for snapshot-isolation reads. No
    /// transaction id is allocated until the first write.
    pub fn begin(&mut self, config: TxnConfig) -> Result<()> {
        if self.txn.is_some() {
            return Err(BrambleError::invalid_config(
                "a transaction is already running in this session",
            ));
        }
        config.validate()?;

        let mut txn = Transaction::new(config);
        if let Some(requested) = txn.config.read_timestamp {
            let validated = self
                .global
                .validate_read_timestamp(requested, txn.config.roundup_read)?;
            self.slot()
                .read_timestamp
                .store(validated.get(), Ordering::Release);
            txn.read_timestamp = Some(validated);
        }
        if txn.config.isolation == IsolationLevel::Snapshot {
            txn.snapshot = Some(self.global.take_snapshot(self.slot_idx, TxnId::NONE));
        }
        debug!(
            slot = self.slot_idx,
            isolation = ?txn.config.isolation,
            read_ts = ?txn.read_timestamp,
            "begin transaction"
        );
        self.txn = Some(txn);
        TxnStats::bump(&self.global.stats.begins_total);
        Ok(())
    }

    // -- configuration --

    /// Change the isolation level [`Session::begin_default`] uses.
    ///
    /// Only allowed between transactions.
    pub fn set_default_isolation(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.txn.is_some() {
            return Err(BrambleError::invalid_config(
                "isolation may not be changed while a transaction is running",
            ));
        }
        self.default_isolation = isolation;
        Ok(())
    }

    // -- reads --

    /// Read the newest visible value for `key`.
    ///
    /// Returns `Ok(None)` when no version is visible or the visible version
    /// is a tombstone. Returns [`BrambleError::PrepareConflict`] when the
    /// walk lands on another transaction's unresolved prepared update and
    /// this transaction does not ignore prepares.
    pub fn read(&mut self, key: RecordKey) -> Result<Option<Vec<u8>>> {
        self.ensure_view_current()?;
        let Some(txn) = self.txn.as_ref() else {
            return Err(Self::no_transaction());
        };
        let view = ReadView {
            isolation: txn.config.isolation,
            snapshot: txn.snapshot.as_ref(),
            read_timestamp: txn.read_timestamp,
            own_id: txn.id,
            ignore_prepare: txn.config.ignore_prepare,
        };
        match self.global.updates.visible_update(key, &view) {
            Ok(Some(record)) => Ok(match record.kind() {
                UpdateKind::Tombstone => None,
                _ => record.value().map(<[u8]>::to_vec),
            }),
            Ok(None) => Ok(None),
            Err(err) => {
                if matches!(err, BrambleError::PrepareConflict) {
                    TxnStats::bump(&self.global.stats.prepare_conflicts_total);
                }
                Err(err)
            }
        }
    }

    /// Materialize the read view and return the snapshot backing it.
    ///
    /// Read-uncommitted transactions carry no snapshot and get `Ok(None)`;
    /// the other isolation levels get the same view `read` would use.
    pub fn get_snapshot(&mut self) -> Result<Option<&Snapshot>> {
        self.ensure_view_current()?;
        Ok(self.txn.as_ref().and_then(|txn| txn.snapshot.as_ref()))
    }

    /// Bring the transaction's read view up to date for its isolation level.
    ///
    /// Snapshot isolation keeps the snapshot taken at begin. Read-committed
    /// retakes it when the commit generation has moved, and reuses the
    /// cached one otherwise. Read-uncommitted has no snapshot but still
    /// publishes a pin so the oldest scan accounts for it; that publish is
    /// unlocked, which is why the scan tolerates pins below `oldest_id`.
    fn ensure_view_current(&mut self) -> Result<()> {
        let global = Arc::clone(&self.global);
        let slot_idx = self.slot_idx;
        let Some(txn) = self.txn.as_mut() else {
            return Err(Self::no_transaction());
        };
        if txn.prepared {
            return Err(Self::prepared_guard());
        }
        match txn.config.isolation {
            IsolationLevel::Snapshot => {
                if txn.snapshot.is_none() {
                    txn.snapshot = Some(global.take_snapshot(slot_idx, txn.id));
                }
            }
            IsolationLevel::ReadCommitted => {
                let generation = global.commit_generation();
                let reusable = txn
                    .snapshot
                    .as_ref()
                    .map_or(false, |snap| snap.generation() == generation);
                if reusable {
                    TxnStats::bump(&global.stats.snapshot_generation_hits_total);
                } else {
                    txn.snapshot = Some(global.take_snapshot(slot_idx, txn.id));
                }
            }
            IsolationLevel::ReadUncommitted => {
                let slot = global.slots.get(slot_idx);
                if slot.pinned_id.load(Ordering::Acquire) == TxnId::NONE.get() {
                    slot.pinned_id
                        .store(global.last_running().get(), Ordering::Release);
                }
            }
        }
        Ok(())
    }

    // -- writes --

    /// Publish a new value for `key`.
    ///
    /// Fails with [`BrambleError::RollbackRequired`] when the key's newest
    /// live update belongs to a concurrent transaction or to one that
    /// committed after this transaction's snapshot was taken; the loser
    /// must roll back.
    pub fn put(&mut self, key: RecordKey, value: Vec<u8>) -> Result<()> {
        self.modify(key, UpdateKind::Standard, Some(value), false)
    }

    /// Publish a deletion tombstone for `key`.
    pub fn delete(&mut self, key: RecordKey) -> Result<()> {
        self.modify(key, UpdateKind::Tombstone, None, false)
    }

    /// Reserve `key` without writing a value.
    ///
    /// The reservation conflicts with concurrent writers like any update
    /// but carries no data; commit discards it.
    pub fn reserve(&mut self, key: RecordKey) -> Result<()> {
        self.modify(key, UpdateKind::Reserve, None, false)
    }

    /// Publish a history maintenance write for `key`.
    ///
    /// History writes become visible to every transaction at commit instead
    /// of being stamped with the committing id. They cannot be prepared.
    pub fn put_history(&mut self, key: RecordKey, value: Vec<u8>) -> Result<()> {
        self.modify(key, UpdateKind::Standard, Some(value), true)
    }

    fn modify(
        &mut self,
        key: RecordKey,
        kind: UpdateKind,
        value: Option<Vec<u8>>,
        history: bool,
    ) -> Result<()> {
        self.ensure_view_current()?;
        let global = Arc::clone(&self.global);
        let slot_idx = self.slot_idx;
        let Some(txn) = self.txn.as_mut() else {
            return Err(Self::no_transaction());
        };
        if txn.read_only {
            return Err(BrambleError::invalid_config(
                "read-only transactions may not modify data",
            ));
        }
        {
            // First-updater wins: lose to any concurrent or newer update
            // before allocating an id or touching the chain.
            let view = ReadView {
                isolation: txn.config.isolation,
                snapshot: txn.snapshot.as_ref(),
                read_timestamp: None,
                own_id: txn.id,
                ignore_prepare: false,
            };
            global.updates.check_write_conflict(key, &view)?;
        }
        if txn.id.is_none() {
            txn.id = global.allocate_id(global.slots.get(slot_idx));
            debug!(slot = slot_idx, id = %txn.id, "allocated transaction id");
        }
        let update = global.updates.publish(key, txn.id, kind, value);
        txn.operations.push(Operation {
            key,
            update,
            history,
            repeated: false,
            reserved: false,
        });
        Ok(())
    }

    // -- timestamps --

    /// Set the transaction's read timestamp after begin.
    ///
    /// Allowed once, and only under snapshot isolation.
    pub fn set_read_timestamp(&mut self, ts: Timestamp) -> Result<()> {
        let global = Arc::clone(&self.global);
        let slot_idx = self.slot_idx;
        let Some(txn) = self.txn.as_mut() else {
            return Err(Self::no_transaction());
        };
        if txn.prepared {
            return Err(Self::prepared_guard());
        }
        if txn.config.isolation != IsolationLevel::Snapshot {
            return Err(BrambleError::invalid_config(
                "read timestamps require snapshot isolation",
            ));
        }
        if txn.read_timestamp.is_some() {
            return Err(BrambleError::invalid_config(
                "a read timestamp may only be set once",
            ));
        }
        let validated = global.validate_read_timestamp(ts, txn.config.roundup_read)?;
        global
            .slots
            .get(slot_idx)
            .read_timestamp
            .store(validated.get(), Ordering::Release);
        txn.read_timestamp = Some(validated);
        Ok(())
    }

    // -- cache-pressure advisories --

    /// Check whether this transaction holds the oldest running id.
    ///
    /// Eviction calls this to pick a victim when the table cannot advance.
    /// Returns [`BrambleError::RollbackRequired`] and records the reason on
    /// the transaction when this session is the blocker. Prepared
    /// transactions are never told to roll back here; their outcome is
    /// decided by the coordinator.
    pub fn is_blocking_oldest(&mut self) -> Result<()> {
        let global = Arc::clone(&self.global);
        let Some(txn) = self.txn.as_mut() else {
            return Ok(());
        };
        if txn.id.is_none() || txn.prepared || global.any_running_id_below(txn.id) {
            return Ok(());
        }
        let reason = "oldest transaction id rolled back for eviction";
        txn.rollback_reason = Some(reason.to_owned());
        Err(BrambleError::rollback_required(reason))
    }

    /// Check whether this transaction pins the oldest snapshot.
    ///
    /// Only advises once the transaction's operation timeout has fired:
    /// rolling back a read-only transaction is a real cost, and setting the
    /// timeout is how a caller signals it is prepared to pay it.
    pub fn is_blocking_pinned(&mut self) -> Result<()> {
        let global = Arc::clone(&self.global);
        let Some(txn) = self.txn.as_mut() else {
            return Ok(());
        };
        let Some(snap) = &txn.snapshot else {
            return Ok(());
        };
        if !txn.op_timer_fired() || global.any_pinned_id_below(snap.snap_min()) {
            return Ok(());
        }
        let reason = "oldest pinned transaction id rolled back for eviction";
        txn.rollback_reason = Some(reason.to_owned());
        Err(BrambleError::rollback_required(reason))
    }

    // -- accessors --

    /// The running transaction's id, if one has been allocated.
    #[must_use]
    pub fn id(&self) -> Option<TxnId> {
        match &self.txn {
            Some(txn) if txn.id.is_some() => Some(txn.id),
            _ => None,
        }
    }

    /// Whether a transaction is running (prepared counts as running).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.txn.is_some()
    }

    /// Whether the running transaction has been prepared.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.txn.as_ref().map_or(false, |txn| txn.prepared)
    }

    /// The running transaction's snapshot, if it holds one.
    #[must_use]
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.txn.as_ref().and_then(|txn| txn.snapshot.as_ref())
    }

    /// The validated read timestamp, if one was set.
    #[must_use]
    pub fn read_timestamp(&self) -> Option<Timestamp> {
        self.txn.as_ref().and_then(|txn| txn.read_timestamp)
    }

    /// Why this transaction was told to roll back, if it was.
    #[must_use]
    pub fn rollback_reason(&self) -> Option<&str> {
        self.txn
            .as_ref()
            .and_then(|txn| txn.rollback_reason.as_deref())
    }

    /// Number of updates published so far.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.txn.as_ref().map_or(0, |txn| txn.operations.len())
    }

    pub(crate) fn slot(&self) -> &crate::slot::TxnSlot {
        self.global.slots.get(self.slot_idx)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.txn.is_some() {
            let _ = self.rollback();
        }
        self.global.slots.unclaim(self.slot_idx);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("slot_idx", &self.slot_idx)
            .field("running", &self.txn.is_some())
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

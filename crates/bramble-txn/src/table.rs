//! The public transaction-table handle.

use std::sync::Arc;

use bramble_error::Result;
use bramble_types::{IsolationLevel, Timestamp, TxnId};

use crate::global::TxnGlobal;
use crate::session::Session;
use crate::stats::{TxnStatsSnapshot, TxnTableDump};
use crate::timestamps::{GlobalTimestamps, TimestampQuery};

// ---------------------------------------------------------------------------
// TxnTable
// ---------------------------------------------------------------------------

/// A shared MVCC transaction table.
///
/// The table owns the id space, the global timestamps, the slot array, and
/// the update store. It hands out [`Session`]s, each bound to one slot for
/// its lifetime; all transaction work happens through sessions. The handle
/// is cheap to clone and every clone addresses the same table.
#[derive(Clone)]
pub struct TxnTable {
    global: Arc<TxnGlobal>,
}

impl TxnTable {
    /// Create a table with room for `capacity` concurrent sessions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            global: Arc::new(TxnGlobal::new(capacity)),
        }
    }

    /// Open a session with snapshot isolation as its default.
    pub fn open_session(&self) -> Result<Session> {
        self.open_session_with(IsolationLevel::Snapshot)
    }

    /// Open a session with `isolation` as its default level.
    ///
    /// Fails with [`bramble_error::BrambleError::SlotsExhausted`] when every
    /// slot is taken.
    pub fn open_session_with(&self, isolation: IsolationLevel) -> Result<Session> {
        Session::open(Arc::clone(&self.global), isolation)
    }

    // -- id space --

    /// Next id to be allocated.
    #[must_use]
    pub fn current(&self) -> TxnId {
        self.global.current()
    }

    /// Published last-running id.
    #[must_use]
    pub fn last_running(&self) -> TxnId {
        self.global.last_running()
    }

    /// Published oldest id: versions below it are reclaimable.
    #[must_use]
    pub fn oldest_id(&self) -> TxnId {
        self.global.oldest_id()
    }

    /// Published checkpoint-metadata floor.
    #[must_use]
    pub fn metadata_pinned(&self) -> TxnId {
        self.global.metadata_pinned()
    }

    /// Re-derive and publish the trailing ids.
    ///
    /// With `strict` the scan always publishes; otherwise small moves are
    /// deferred. With `wait` false a held scan lock yields
    /// [`bramble_error::BrambleError::Busy`] instead of blocking.
    pub fn update_oldest(&self, strict: bool, wait: bool) -> Result<()> {
        self.global.update_oldest(strict, wait)
    }

    // -- timestamps --

    /// Apply a batch of global timestamp updates.
    pub fn set_timestamps(&self, update: &GlobalTimestamps) -> Result<()> {
        self.global.set_timestamps(update)
    }

    /// Query one of the global timestamps.
    #[must_use]
    pub fn query_timestamp(&self, which: TimestampQuery) -> Option<Timestamp> {
        self.global.query_timestamp(which)
    }

    /// The pinned timestamp, the floor history retention must respect.
    #[must_use]
    pub fn pinned_timestamp(&self) -> Option<Timestamp> {
        self.global.query_timestamp(TimestampQuery::Pinned)
    }

    /// Recompute the pinned timestamp from the oldest timestamp and the
    /// oldest reader.
    pub fn update_pinned_timestamp(&self, force: bool) {
        self.global.update_pinned_timestamp(force);
    }

    // -- table-wide configuration --

    /// Whether commits flush the log by default.
    #[must_use]
    pub fn default_sync(&self) -> bool {
        self.global.default_sync()
    }

    /// Set the table-wide default for commit log flushing.
    pub fn set_default_sync(&self, sync: bool) {
        self.global.set_default_sync(sync);
    }

    // -- checkpoint and named-snapshot integration --

    /// Id of the running checkpoint's transaction, or `NONE`.
    #[must_use]
    pub fn checkpoint_id(&self) -> TxnId {
        self.global.checkpoint_id()
    }

    /// Register a running checkpoint so concurrent snapshots wait for its
    /// reads. Panics if a checkpoint is already registered.
    pub fn set_checkpoint_id(&self, id: TxnId) {
        self.global.set_checkpoint_id(id);
    }

    /// Deregister the running checkpoint.
    pub fn clear_checkpoint_id(&self) {
        self.global.clear_checkpoint_id();
    }

    /// Oldest id pinned by a named snapshot, or `NONE`.
    #[must_use]
    pub fn named_snapshot_floor(&self) -> TxnId {
        self.global.named_snapshot_floor()
    }

    /// Pin the oldest id at `id` on behalf of named snapshots; `NONE`
    /// clears the floor.
    pub fn set_named_snapshot_floor(&self, id: TxnId) {
        self.global.set_named_snapshot_floor(id);
    }

    /// Drop the named-snapshot floor.
    pub fn clear_named_snapshot_floor(&self) {
        self.global.set_named_snapshot_floor(TxnId::NONE);
    }

    // -- diagnostics --

    /// Number of session slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.global.slots.capacity()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.global.slots.claimed_count()
    }

    /// Whether any transaction is running or allocating.
    #[must_use]
    pub fn any_active(&self) -> bool {
        self.global.any_active()
    }

    /// Spin until no transaction is running.
    pub fn activity_drain(&self) {
        self.global.activity_drain();
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> TxnStatsSnapshot {
        self.global.stats_snapshot()
    }

    /// Zero every counter.
    pub fn reset_stats(&self) {
        self.global.stats.reset();
    }

    /// Unlocked verbose dump of the table and every slot.
    #[must_use]
    pub fn dump(&self) -> TxnTableDump {
        self.global.dump()
    }
}

impl std::fmt::Debug for TxnTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnTable")
            .field("capacity", &self.capacity())
            .field("active_sessions", &self.active_sessions())
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Commit, prepare, and rollback.
//!
//! Commit is split into a validation half and a resolution half. Validation
//! can fail and leaves the transaction untouched so the caller may fix the
//! configuration or roll back; once resolution starts, nothing is allowed to
//! fail. Prepared transactions complicate that shape: their slot id was
//! cleared at prepare time, so resolution re-locates every update by walking
//! its key's chain for records the transaction still owns.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use bramble_error::{BrambleError, Result};
use bramble_types::{IsolationLevel, PrepareState, Timestamp, TxnId, UpdateKind};

use crate::config::{CommitConfig, SyncSetting};
use crate::session::{Session, Transaction};
use crate::stats::TxnStats;

impl Session {
    // -- commit --

    /// Commit the running transaction.
    ///
    /// On a validation error the transaction keeps running; the caller may
    /// retry with a different configuration or roll back. Once validation
    /// passes the commit cannot fail.
    pub fn commit(&mut self, config: CommitConfig) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Err(Self::no_transaction());
        };
        let (commit_ts, durable_ts) = match self.validate_commit(&txn, &config) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.txn = Some(txn);
                return Err(err);
            }
        };
        self.commit_resolved(txn, &config, commit_ts, durable_ts);
        Ok(())
    }

    /// Validate the commit configuration and resolve the effective commit
    /// and durable timestamps. Round-up may substitute the prepare
    /// timestamp for a too-early commit timestamp, so later stages must use
    /// the returned pair rather than the raw configuration.
    fn validate_commit(
        &self,
        txn: &Transaction,
        config: &CommitConfig,
    ) -> Result<(Option<Timestamp>, Option<Timestamp>)> {
        if config.sync.is_set() && txn.sync_set {
            return Err(BrambleError::invalid_config(
                "sync was set at begin and may not be set again at commit",
            ));
        }
        let (commit_ts, durable_ts) = if txn.prepared {
            let Some(mut commit_ts) = config.commit_timestamp else {
                return Err(BrambleError::invalid_timestamp(
                    "prepared transactions require a commit timestamp",
                ));
            };
            let Some(durable_ts) = config.durable_timestamp else {
                return Err(BrambleError::invalid_timestamp(
                    "prepared transactions require a durable timestamp",
                ));
            };
            if commit_ts.is_none() {
                return Err(BrambleError::invalid_timestamp(
                    "commit timestamp must be non-zero",
                ));
            }
            let prepare_ts = txn.prepare_timestamp.unwrap_or(Timestamp::NONE);
            if commit_ts < prepare_ts {
                if txn.config.roundup_prepared {
                    commit_ts = prepare_ts;
                } else {
                    return Err(BrambleError::invalid_timestamp(format!(
                        "commit timestamp {commit_ts} is earlier than the prepare timestamp {prepare_ts}"
                    )));
                }
            }
            if durable_ts < commit_ts {
                return Err(BrambleError::invalid_timestamp(format!(
                    "durable timestamp {durable_ts} is earlier than the commit timestamp {commit_ts}"
                )));
            }
            (Some(commit_ts), Some(durable_ts))
        } else {
            if config.durable_timestamp.is_some() {
                return Err(BrambleError::invalid_timestamp(
                    "durable timestamps may only be given for prepared transactions",
                ));
            }
            if let Some(commit_ts) = config.commit_timestamp {
                self.global.validate_commit_timestamp(commit_ts)?;
            }
            (config.commit_timestamp, config.commit_timestamp)
        };
        self.validate_operation_timestamps(txn, commit_ts, durable_ts)?;
        Ok((commit_ts, durable_ts))
    }

    /// Per-key commit-time timestamp discipline.
    ///
    /// For each operation, find the newest older record on its key that is
    /// still live and belongs to another transaction. A timestamped history
    /// may not be extended by an untimestamped commit, and neither commit
    /// nor durable timestamps may move backward along a chain. The first
    /// timestamped commit on a previously untimestamped key is allowed.
    fn validate_operation_timestamps(
        &self,
        txn: &Transaction,
        commit_ts: Option<Timestamp>,
        durable_ts: Option<Timestamp>,
    ) -> Result<()> {
        let store = &self.global.updates;
        for op in &txn.operations {
            if op.history {
                continue;
            }
            let Some(record) = store.get(op.update) else {
                continue;
            };
            if record.kind() == UpdateKind::Reserve {
                continue;
            }
            let mut prev = None;
            let mut cursor = record.next();
            while let Some(idx) = cursor {
                let Some(older) = store.get(idx) else {
                    break;
                };
                cursor = older.next();
                let owner = older.owner();
                if owner.is_aborted() || owner == txn.id {
                    continue;
                }
                if older.kind() == UpdateKind::Reserve {
                    continue;
                }
                prev = Some(older);
                break;
            }
            let Some(prev) = prev else {
                continue;
            };
            let prev_ts = prev.start_ts();
            if prev_ts.is_some() {
                let Some(ts) = commit_ts else {
                    return Err(BrambleError::invalid_timestamp(format!(
                        "{} has timestamped updates; commits on it require a commit timestamp",
                        op.key
                    )));
                };
                if ts < prev_ts {
                    return Err(BrambleError::invalid_timestamp(format!(
                        "commit timestamp {ts} on {} precedes the previous update at {prev_ts}",
                        op.key
                    )));
                }
            }
            if let Some(durable) = durable_ts {
                let prev_durable = prev.durable_ts();
                if prev_durable.is_some() && durable < prev_durable {
                    return Err(BrambleError::invalid_timestamp(format!(
                        "durable timestamp {durable} on {} precedes the previous update at {prev_durable}",
                        op.key
                    )));
                }
            }
        }
        Ok(())
    }

    /// The infallible half of commit.
    fn commit_resolved(
        &mut self,
        txn: Transaction,
        config: &CommitConfig,
        commit_ts: Option<Timestamp>,
        durable_ts: Option<Timestamp>,
    ) {
        let global = Arc::clone(&self.global);
        let read_write = txn.id.is_some();
        let sync = match config.sync {
            SyncSetting::On => true,
            SyncSetting::Off => false,
            SyncSetting::Inherit => match txn.config.sync {
                SyncSetting::On => true,
                SyncSetting::Off => false,
                SyncSetting::Inherit => global.default_sync(),
            },
        };

        if txn.prepared {
            if let (Some(cts), Some(dts)) = (commit_ts, durable_ts) {
                self.resolve_prepared(&txn, Some((cts, dts)));
            }
        } else {
            for op in &txn.operations {
                let Some(record) = global.updates.get(op.update) else {
                    continue;
                };
                if record.kind() == UpdateKind::Reserve {
                    record.set_owner(TxnId::ABORTED);
                    continue;
                }
                if op.history {
                    // History maintenance writes become everyone's data.
                    record.set_owner(TxnId::NONE);
                }
                if let Some(ts) = commit_ts {
                    if record.start_ts().is_none() {
                        record.set_start_ts(ts);
                        if let Some(durable) = durable_ts {
                            record.set_durable_ts(durable);
                        }
                    }
                }
            }
        }

        // Snapshot pins must not ride across the log flush; the durability
        // point comes after this release.
        let read_uncommitted = txn.config.isolation == IsolationLevel::ReadUncommitted;
        global.release_snapshot_pin(self.slot_idx, read_uncommitted);
        debug!(
            id = %txn.id,
            updates = txn.operations.len(),
            sync,
            prepared = txn.prepared,
            "commit transaction"
        );

        // Clearing the slot id is the visibility point for everything this
        // transaction published.
        global.slots.get(self.slot_idx).clear_all();
        if read_write {
            global.bump_commit_generation();
        }
        if let Some(durable) = durable_ts {
            global.update_durable_timestamp(durable);
        }
        TxnStats::bump(&global.stats.commits_total);
    }

    // -- prepare --

    /// Prepare the running transaction at `prepare_timestamp`.
    ///
    /// Every update is stamped with the prepare timestamp and published as
    /// in-progress, then the slot stops advertising the transaction's id.
    /// From that point new snapshots no longer treat the id as running and
    /// conflict detection moves to the per-record prepared state. Only
    /// commit and rollback are allowed afterward.
    pub fn prepare(&mut self, prepare_timestamp: Timestamp) -> Result<()> {
        let global = Arc::clone(&self.global);
        let slot_idx = self.slot_idx;
        let Some(txn) = self.txn.as_mut() else {
            return Err(Self::no_transaction());
        };
        if txn.prepared {
            return Err(BrambleError::invalid_config(
                "transaction is already prepared",
            ));
        }
        if txn.operations.iter().any(|op| op.history) {
            return Err(BrambleError::invalid_config(
                "history maintenance writes cannot be prepared",
            ));
        }
        let ts = global.validate_prepare_timestamp(prepare_timestamp, txn.config.roundup_prepared)?;
        if let Some(stable) = global.stable_timestamp() {
            if ts <= stable {
                return Err(BrambleError::invalid_timestamp(format!(
                    "prepare timestamp {ts} must be after stable timestamp {stable}"
                )));
            }
        }

        // Stamp newest-first and mark duplicate keys so resolution walks
        // each chain exactly once. Reservations die here: they conflict
        // with writers while running but carry nothing to resolve.
        let mut seen = HashSet::new();
        for op in txn.operations.iter_mut().rev() {
            let Some(record) = global.updates.get(op.update) else {
                continue;
            };
            if record.kind() == UpdateKind::Reserve {
                record.set_owner(TxnId::ABORTED);
                op.reserved = true;
                continue;
            }
            record.set_start_ts(ts);
            record.set_prepare_state(PrepareState::InProgress);
            if !seen.insert(op.key) {
                op.repeated = true;
            }
        }

        global.release_snapshot_pin(
            slot_idx,
            txn.config.isolation == IsolationLevel::ReadUncommitted,
        );
        txn.snapshot = None;
        global
            .slots
            .get(slot_idx)
            .id
            .store(TxnId::NONE.get(), Ordering::Release);
        txn.prepare_timestamp = Some(ts);
        txn.prepared = true;
        TxnStats::bump(&global.stats.prepares_total);
        debug!(
            id = %txn.id,
            prepare_ts = %ts,
            updates = txn.operations.len(),
            "prepare transaction"
        );
        Ok(())
    }

    // -- rollback --

    /// Roll back the running transaction.
    ///
    /// Every update the transaction published is tombstoned with the
    /// aborted id. Rollback itself cannot fail; the only error is calling
    /// it with no transaction running.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Err(Self::no_transaction());
        };
        let global = Arc::clone(&self.global);
        if txn.prepared {
            self.resolve_prepared(&txn, None);
        } else {
            for op in &txn.operations {
                let Some(record) = global.updates.get(op.update) else {
                    continue;
                };
                let owner = record.owner();
                assert!(
                    owner == txn.id || owner.is_aborted(),
                    "rolling back an update owned by {owner}, expected {}",
                    txn.id
                );
                record.set_owner(TxnId::ABORTED);
            }
        }
        match &txn.rollback_reason {
            Some(reason) => debug!(id = %txn.id, reason = %reason, "rollback transaction"),
            None => debug!(id = %txn.id, updates = txn.operations.len(), "rollback transaction"),
        }
        global.release_snapshot_pin(
            self.slot_idx,
            txn.config.isolation == IsolationLevel::ReadUncommitted,
        );
        global.slots.get(self.slot_idx).clear_all();
        TxnStats::bump(&global.stats.rollbacks_total);
        Ok(())
    }

    // -- prepared resolution --

    /// Re-locate and resolve every update of a prepared transaction.
    ///
    /// `outcome` is `Some((commit_ts, durable_ts))` to commit and `None` to
    /// abort. Updates are found by walking each operation's key chain for
    /// records this transaction owns; operations marked repeated or
    /// reserved at prepare time are skipped so each chain is walked once.
    /// Every record found must still be in the in-progress prepared state.
    /// A mismatch means the table is corrupted, and resolution panics
    /// rather than continue.
    fn resolve_prepared(&self, txn: &Transaction, outcome: Option<(Timestamp, Timestamp)>) {
        let store = &self.global.updates;
        let mut visited = 0_usize;
        let mut resolved = 0_usize;
        for op in &txn.operations {
            if op.repeated || op.reserved {
                continue;
            }
            let mut found = false;
            let mut cursor = store.head(op.key);
            while let Some(idx) = cursor {
                let Some(record) = store.get(idx) else {
                    break;
                };
                cursor = record.next();
                if record.owner() != txn.id {
                    continue;
                }
                visited += 1;
                found = true;
                if record.prepare_state() == PrepareState::InProgress {
                    match outcome {
                        Some((commit_ts, durable_ts)) => {
                            record.set_start_ts(commit_ts);
                            record.set_durable_ts(durable_ts);
                            record.set_prepare_state(PrepareState::Resolved);
                        }
                        None => {
                            record.set_owner(TxnId::ABORTED);
                            record.set_prepare_state(PrepareState::Resolved);
                        }
                    }
                    resolved += 1;
                }
            }
            assert!(
                found,
                "prepared update for {} vanished before resolution",
                op.key
            );
        }
        assert_eq!(
            resolved, visited,
            "prepared transaction {} resolved {resolved} of {visited} updates",
            txn.id
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use bramble_types::{IsolationLevel, RecordKey};

    use crate::config::TxnConfig;
    use crate::global::TxnGlobal;

    fn table(capacity: usize) -> Arc<TxnGlobal> {
        Arc::new(TxnGlobal::new(capacity))
    }

    fn open(global: &Arc<TxnGlobal>) -> Session {
        Session::open(Arc::clone(global), IsolationLevel::Snapshot).unwrap()
    }

    fn key(n: u64) -> RecordKey {
        RecordKey::new(n)
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n)
    }

    /// Commit a single value so later transactions have history to read.
    fn seed(global: &Arc<TxnGlobal>, k: RecordKey, value: &[u8]) {
        let mut session = open(global);
        session.begin_default().unwrap();
        session.put(k, value.to_vec()).unwrap();
        session.commit(CommitConfig::default()).unwrap();
    }

    #[test]
    fn commit_without_transaction_errors() {
        let global = table(2);
        let mut session = open(&global);
        assert!(session.commit(CommitConfig::default()).is_err());
        assert!(session.rollback().is_err());
    }

    #[test]
    fn empty_commit_does_not_bump_generation() {
        let global = table(2);
        let mut session = open(&global);
        session.begin_default().unwrap();
        let generation = global.commit_generation();
        session.commit(CommitConfig::default()).unwrap();
        assert_eq!(global.commit_generation(), generation);
        assert_eq!(global.stats_snapshot().commits_total, 1);
        assert!(!session.is_running());
    }

    #[test]
    fn committed_value_visible_to_later_snapshots() {
        let global = table(4);
        let generation = global.commit_generation();
        seed(&global, key(1), b"one");
        assert_eq!(global.commit_generation(), generation + 1);

        let mut reader = open(&global);
        reader.begin_default().unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn commit_clears_slot_state() {
        let global = table(2);
        let mut session = open(&global);
        session.begin_default().unwrap();
        session.put(key(1), vec![1]).unwrap();
        assert!(session.slot().has_running_txn(Ordering::Acquire));
        session.commit(CommitConfig::default()).unwrap();
        let slot = global.slots.get(0);
        assert!(!slot.has_running_txn(Ordering::Acquire));
        assert_eq!(slot.pinned_id.load(Ordering::Acquire), 0);
        assert_eq!(slot.read_timestamp.load(Ordering::Acquire), 0);
    }

    #[test]
    fn sync_set_at_begin_and_commit_is_rejected() {
        let global = table(2);
        let mut session = open(&global);
        session
            .begin(TxnConfig {
                sync: SyncSetting::On,
                ..TxnConfig::default()
            })
            .unwrap();
        session.put(key(1), vec![1]).unwrap();

        let err = session
            .commit(CommitConfig {
                sync: SyncSetting::Off,
                ..CommitConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, BrambleError::InvalidConfig { .. }));
        assert!(session.is_running(), "failed commit leaves the transaction");

        session.commit(CommitConfig::default()).unwrap();
    }

    #[test]
    fn durable_timestamp_rejected_for_non_prepared() {
        let global = table(2);
        let mut session = open(&global);
        session.begin_default().unwrap();
        session.put(key(1), vec![1]).unwrap();
        let err = session
            .commit(CommitConfig {
                commit_timestamp: Some(ts(5)),
                durable_timestamp: Some(ts(6)),
                sync: SyncSetting::Inherit,
            })
            .unwrap_err();
        assert!(matches!(err, BrambleError::InvalidTimestamp { .. }));
        session.rollback().unwrap();
    }

    #[test]
    fn out_of_order_commit_timestamp_rejected() {
        let global = table(4);
        let mut first = open(&global);
        first.begin_default().unwrap();
        first.put(key(1), vec![1]).unwrap();
        first.commit(CommitConfig::at(ts(10))).unwrap();

        let mut second = open(&global);
        second.begin_default().unwrap();
        second.put(key(1), vec![2]).unwrap();
        let err = second.commit(CommitConfig::at(ts(5))).unwrap_err();
        assert!(matches!(err, BrambleError::InvalidTimestamp { .. }));

        // The transaction survives and can commit at a later timestamp.
        second.commit(CommitConfig::at(ts(11))).unwrap();
    }

    #[test]
    fn untimestamped_commit_on_timestamped_key_rejected() {
        let global = table(4);
        let mut first = open(&global);
        first.begin_default().unwrap();
        first.put(key(1), vec![1]).unwrap();
        first.commit(CommitConfig::at(ts(10))).unwrap();

        let mut second = open(&global);
        second.begin_default().unwrap();
        second.put(key(1), vec![2]).unwrap();
        let err = second.commit(CommitConfig::default()).unwrap_err();
        assert!(matches!(err, BrambleError::InvalidTimestamp { .. }));
        second.rollback().unwrap();
    }

    #[test]
    fn first_timestamped_commit_on_untimestamped_key_allowed() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut session = open(&global);
        session.begin_default().unwrap();
        session.put(key(1), vec![2]).unwrap();
        session.commit(CommitConfig::at(ts(10))).unwrap();
    }

    #[test]
    fn reservation_is_discarded_at_commit() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut session = open(&global);
        session.begin_default().unwrap();
        session.reserve(key(1)).unwrap();
        session.commit(CommitConfig::default()).unwrap();

        let mut reader = open(&global);
        reader.begin_default().unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(b"base".to_vec()));
    }

    #[test]
    fn rollback_hides_published_updates() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put(key(1), vec![9]).unwrap();
        writer.delete(key(2)).unwrap();
        writer.rollback().unwrap();
        assert!(!writer.is_running());

        let mut reader = open(&global);
        reader.begin_default().unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(b"base".to_vec()));
        assert_eq!(reader.read(key(2)).unwrap(), None);
        assert_eq!(global.stats_snapshot().rollbacks_total, 1);
    }

    #[test]
    fn dropping_a_running_session_rolls_back() {
        let global = table(4);
        {
            let mut writer = open(&global);
            writer.begin_default().unwrap();
            writer.put(key(1), vec![1]).unwrap();
        }
        assert_eq!(global.stats_snapshot().rollbacks_total, 1);
        let mut reader = open(&global);
        reader.begin_default().unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), None);
    }

    // -- write conflicts --

    #[test]
    fn concurrent_writers_conflict_on_the_same_key() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut first = open(&global);
        first.begin_default().unwrap();
        first.put(key(1), vec![1]).unwrap();

        let mut second = open(&global);
        second.begin_default().unwrap();
        let err = second.put(key(1), vec![2]).unwrap_err();
        assert!(matches!(err, BrambleError::RollbackRequired { .. }));
        assert!(!err.leaves_transaction_usable());
        second.rollback().unwrap();

        // Different keys never collide.
        first.put(key(2), vec![3]).unwrap();
        first.commit(CommitConfig::default()).unwrap();
    }

    #[test]
    fn first_updater_wins_across_a_commit() {
        let global = table(4);
        seed(&global, key(1), b"base");

        // The loser's snapshot predates the winner's commit.
        let mut loser = open(&global);
        loser.begin_default().unwrap();

        let mut winner = open(&global);
        winner.begin_default().unwrap();
        winner.put(key(1), vec![1]).unwrap();
        winner.commit(CommitConfig::default()).unwrap();

        let err = loser.put(key(1), vec![2]).unwrap_err();
        assert!(matches!(err, BrambleError::RollbackRequired { .. }));
        loser.rollback().unwrap();
    }

    #[test]
    fn write_over_prepared_update_conflicts() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut prep = open(&global);
        prep.begin_default().unwrap();
        prep.put(key(1), vec![1]).unwrap();
        prep.prepare(ts(5)).unwrap();

        // Prepared slots stop advertising their id, so a fresh snapshot
        // considers the id resolved; the record's prepared state still
        // wins the conflict.
        let mut writer = open(&global);
        writer.begin_default().unwrap();
        let err = writer.put(key(1), vec![2]).unwrap_err();
        assert!(matches!(err, BrambleError::RollbackRequired { .. }));
        writer.rollback().unwrap();
        prep.rollback().unwrap();
    }

    #[test]
    fn rolled_back_update_does_not_conflict() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut aborted = open(&global);
        aborted.begin_default().unwrap();
        aborted.put(key(1), vec![9]).unwrap();
        aborted.rollback().unwrap();

        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put(key(1), vec![2]).unwrap();
        writer.commit(CommitConfig::default()).unwrap();
    }

    // -- prepared transactions --

    #[test]
    fn prepare_publishes_conflicts_then_commit_resolves_by_timestamp() {
        let global = table(8);
        seed(&global, key(1), b"old");

        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put(key(1), b"new".to_vec()).unwrap();
        writer.prepare(ts(5)).unwrap();
        assert!(writer.is_prepared());
        assert!(
            !global.slots.get(writer.slot_idx).has_running_txn(Ordering::Acquire),
            "prepare clears the slot id"
        );

        // A reader at timestamp 6 sees the in-progress prepare.
        let mut reader = open(&global);
        reader
            .begin(TxnConfig {
                read_timestamp: Some(ts(6)),
                ..TxnConfig::default()
            })
            .unwrap();
        let err = reader.read(key(1)).unwrap_err();
        assert!(matches!(err, BrambleError::PrepareConflict));
        assert_eq!(global.stats_snapshot().prepare_conflicts_total, 1);

        // The same position with ignore_prepare reads around it.
        let mut around = open(&global);
        around
            .begin(TxnConfig {
                read_timestamp: Some(ts(6)),
                ignore_prepare: true,
                ..TxnConfig::default()
            })
            .unwrap();
        assert_eq!(around.read(key(1)).unwrap(), Some(b"old".to_vec()));

        // Writes after prepare are rejected.
        assert!(writer.put(key(2), vec![2]).is_err());

        writer.commit(CommitConfig::prepared(ts(8), ts(9))).unwrap();

        // The blocked reader retries: the update resolved to commit
        // timestamp 8, above its read timestamp, so it sees the old value.
        assert_eq!(reader.read(key(1)).unwrap(), Some(b"old".to_vec()));

        // A reader above the commit timestamp sees the new value.
        let mut later = open(&global);
        later
            .begin(TxnConfig {
                read_timestamp: Some(ts(9)),
                ..TxnConfig::default()
            })
            .unwrap();
        assert_eq!(later.read(key(1)).unwrap(), Some(b"new".to_vec()));

        assert_eq!(global.durable_timestamp(), Some(ts(9)));
        assert_eq!(global.stats_snapshot().prepares_total, 1);
    }

    #[test]
    fn prepared_commit_timestamps_are_validated() {
        let global = table(4);
        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put(key(1), vec![1]).unwrap();
        writer.prepare(ts(5)).unwrap();

        // Missing timestamps.
        assert!(writer.commit(CommitConfig::default()).is_err());
        // Commit before prepare.
        assert!(writer.commit(CommitConfig::prepared(ts(3), ts(3))).is_err());
        // Durable before commit.
        assert!(writer.commit(CommitConfig::prepared(ts(6), ts(5))).is_err());
        assert!(writer.is_prepared(), "failed commits leave it prepared");

        writer.commit(CommitConfig::prepared(ts(5), ts(5))).unwrap();
        assert_eq!(global.durable_timestamp(), Some(ts(5)));
    }

    #[test]
    fn prepare_timestamp_is_validated() {
        let global = table(4);
        global.store_oldest_timestamp(ts(10));
        global.store_stable_timestamp(ts(12));

        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put(key(1), vec![1]).unwrap();

        // Below oldest, no rounding.
        assert!(writer.prepare(ts(5)).is_err());
        // At or below stable.
        assert!(writer.prepare(ts(12)).is_err());
        writer.prepare(ts(13)).unwrap();
        writer.commit(CommitConfig::prepared(ts(13), ts(13))).unwrap();
    }

    #[test]
    fn prepare_rounds_up_when_asked() {
        let global = table(4);
        global.store_oldest_timestamp(ts(10));

        let mut writer = open(&global);
        writer
            .begin(TxnConfig {
                roundup_prepared: true,
                ..TxnConfig::default()
            })
            .unwrap();
        writer.put(key(1), vec![1]).unwrap();
        writer.prepare(ts(5)).unwrap();
        writer.commit(CommitConfig::prepared(ts(10), ts(10))).unwrap();

        let mut reader = open(&global);
        reader
            .begin(TxnConfig {
                read_timestamp: Some(ts(10)),
                ..TxnConfig::default()
            })
            .unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(vec![1]));
    }

    #[test]
    fn prepared_commit_rounds_up_when_asked() {
        let global = table(4);
        let mut writer = open(&global);
        writer
            .begin(TxnConfig {
                roundup_prepared: true,
                ..TxnConfig::default()
            })
            .unwrap();
        writer.put(key(1), vec![1]).unwrap();
        writer.prepare(ts(5)).unwrap();

        // The commit timestamp is rounded up to the prepare timestamp; the
        // durable timestamp is not, so it must clear the rounded value.
        let err = writer.commit(CommitConfig::prepared(ts(3), ts(3))).unwrap_err();
        assert!(matches!(err, BrambleError::InvalidTimestamp { .. }));
        writer.commit(CommitConfig::prepared(ts(3), ts(5))).unwrap();

        let mut reader = open(&global);
        reader
            .begin(TxnConfig {
                read_timestamp: Some(ts(5)),
                ..TxnConfig::default()
            })
            .unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(vec![1]));
        assert_eq!(global.durable_timestamp(), Some(ts(5)));
    }

    #[test]
    fn prepared_rollback_aborts_updates() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put(key(1), b"gone".to_vec()).unwrap();
        writer.prepare(ts(5)).unwrap();
        writer.rollback().unwrap();

        let mut reader = open(&global);
        reader.begin_default().unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(b"base".to_vec()));
    }

    #[test]
    fn repeated_key_in_prepared_transaction_resolves_cleanly() {
        let global = table(4);
        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put(key(1), vec![1]).unwrap();
        writer.put(key(1), vec![2]).unwrap();
        writer.put(key(2), vec![3]).unwrap();
        writer.prepare(ts(5)).unwrap();
        writer.commit(CommitConfig::prepared(ts(5), ts(5))).unwrap();

        let mut reader = open(&global);
        reader.begin_default().unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(vec![2]));
        assert_eq!(reader.read(key(2)).unwrap(), Some(vec![3]));
    }

    #[test]
    fn reservation_in_prepared_transaction_is_dropped_at_prepare() {
        let global = table(4);
        seed(&global, key(1), b"base");

        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.reserve(key(1)).unwrap();
        writer.put(key(2), vec![2]).unwrap();
        writer.prepare(ts(5)).unwrap();

        // The reservation is gone already: a reader conflicts on key 2 but
        // reads key 1 freely.
        let mut reader = open(&global);
        reader.begin_default().unwrap();
        assert_eq!(reader.read(key(1)).unwrap(), Some(b"base".to_vec()));
        assert!(reader.read(key(2)).unwrap_err().is_transient());

        writer.commit(CommitConfig::prepared(ts(5), ts(5))).unwrap();
    }

    #[test]
    fn history_writes_cannot_be_prepared() {
        let global = table(4);
        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put_history(key(1), vec![1]).unwrap();
        assert!(writer.prepare(ts(5)).is_err());
        writer.rollback().unwrap();
    }

    #[test]
    fn history_write_is_globally_visible_after_commit() {
        let global = table(4);

        // A reader whose snapshot predates the writer's id.
        let mut early = open(&global);
        early.begin_default().unwrap();

        let mut writer = open(&global);
        writer.begin_default().unwrap();
        writer.put_history(key(1), vec![7]).unwrap();
        writer.put(key(2), vec![8]).unwrap();
        writer.commit(CommitConfig::default()).unwrap();

        // The history write is owned by no transaction after commit, so
        // even the early snapshot sees it; the normal write stays hidden.
        assert_eq!(early.read(key(1)).unwrap(), Some(vec![7]));
        assert_eq!(early.read(key(2)).unwrap(), None);
    }

    #[test]
    fn durable_timestamp_tracks_commit_maximum() {
        let global = table(4);
        let mut session = open(&global);

        session.begin_default().unwrap();
        session.put(key(1), vec![1]).unwrap();
        session.commit(CommitConfig::at(ts(10))).unwrap();
        assert_eq!(global.durable_timestamp(), Some(ts(10)));

        session.begin_default().unwrap();
        session.put(key(2), vec![2]).unwrap();
        session.commit(CommitConfig::at(ts(15))).unwrap();
        assert_eq!(global.durable_timestamp(), Some(ts(15)));

        // An earlier commit timestamp does not move it backward.
        session.begin_default().unwrap();
        session.put(key(3), vec![3]).unwrap();
        session.commit(CommitConfig::at(ts(12))).unwrap();
        assert_eq!(global.durable_timestamp(), Some(ts(12)).max(Some(ts(15))));
    }
}

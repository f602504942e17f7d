//! Global timestamp management.
//!
//! Four table-wide timestamps are tracked: durable (everything at or
//! before it survives recovery), oldest (reads before it are no longer
//! supported), stable (checkpoints never include anything after it), and
//! pinned (derived: the oldest timestamp any reader still depends on).
//! The first three are set by the embedding application; pinned is
//! recomputed from the oldest timestamp and published reader timestamps.

use std::sync::atomic::Ordering;

use bramble_error::{BrambleError, Result};
use bramble_types::Timestamp;

use crate::global::TxnGlobal;

// ---------------------------------------------------------------------------
// GlobalTimestamps / TimestampQuery
// ---------------------------------------------------------------------------

/// A batch of global timestamp assignments.
///
/// Unset fields are left alone. `force` bypasses ordering validation and
/// allows moving timestamps backwards; it exists for repair tooling, not
/// regular operation.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct GlobalTimestamps {
    pub durable: Option<Timestamp>,
    pub oldest: Option<Timestamp>,
    pub stable: Option<Timestamp>,
    pub force: bool,
}

/// Which global timestamp to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampQuery {
    /// Largest timestamp at which all commits are durable.
    AllDurable,
    /// The application-set oldest timestamp.
    Oldest,
    /// Smallest read timestamp published by a running transaction.
    OldestReader,
    /// Derived floor of oldest and every active reader.
    Pinned,
    /// The application-set stable timestamp.
    Stable,
}

impl TxnGlobal {
    /// Apply a batch of global timestamp assignments.
    ///
    /// Without `force`: the effective oldest may never be later than the
    /// effective stable, and attempts to move oldest or stable backwards
    /// are ignored rather than rejected, so idempotent re-assignment is
    /// cheap for callers.
    pub fn set_timestamps(&self, update: &GlobalTimestamps) -> Result<()> {
        if update.durable.is_none() && update.oldest.is_none() && update.stable.is_none() {
            return Ok(());
        }

        let mut oldest_moved = false;
        {
            let _guard = self.ts_lock.write();

            if !update.force {
                let effective_oldest = update.oldest.or_else(|| self.oldest_timestamp());
                let effective_stable = update.stable.or_else(|| self.stable_timestamp());
                if let (Some(oldest), Some(stable)) = (effective_oldest, effective_stable) {
                    if oldest > stable {
                        return Err(BrambleError::invalid_timestamp(format!(
                            "oldest timestamp {oldest} must not be later than stable timestamp {stable}"
                        )));
                    }
                }
            }

            if let Some(durable) = update.durable {
                self.store_durable_timestamp(durable);
            }
            if let Some(oldest) = update.oldest {
                if update.force || self.oldest_timestamp().map_or(true, |cur| oldest > cur) {
                    self.store_oldest_timestamp(oldest);
                    oldest_moved = true;
                }
            }
            if let Some(stable) = update.stable {
                if update.force || self.stable_timestamp().map_or(true, |cur| stable > cur) {
                    self.store_stable_timestamp(stable);
                }
            }
        }

        if oldest_moved {
            self.update_pinned_timestamp(update.force);
        }
        Ok(())
    }

    /// Read one of the global timestamps. `None` means it has never been
    /// established.
    #[must_use]
    pub fn query_timestamp(&self, which: TimestampQuery) -> Option<Timestamp> {
        match which {
            TimestampQuery::AllDurable => self.durable_timestamp(),
            TimestampQuery::Oldest => self.oldest_timestamp(),
            TimestampQuery::OldestReader => self.oldest_reader_timestamp(),
            TimestampQuery::Pinned => self.pinned_timestamp(),
            TimestampQuery::Stable => self.stable_timestamp(),
        }
    }

    /// Smallest read timestamp published in any slot.
    #[must_use]
    pub(crate) fn oldest_reader_timestamp(&self) -> Option<Timestamp> {
        self.slots
            .iter()
            .map(|slot| slot.read_timestamp.load(Ordering::Acquire))
            .filter(|&raw| raw != 0)
            .min()
            .map(Timestamp::new)
    }

    /// Recompute the pinned timestamp from oldest plus active readers.
    ///
    /// A no-op until the oldest timestamp exists. The pinned timestamp
    /// only moves forward unless `force` is set.
    pub fn update_pinned_timestamp(&self, force: bool) {
        let Some(candidate) = self.pinned_candidate() else {
            return;
        };
        // Cheap unlocked pre-check before taking the lock.
        if !force {
            if let Some(current) = self.pinned_timestamp() {
                if candidate <= current {
                    return;
                }
            }
        }

        let _guard = self.ts_lock.write();
        let Some(candidate) = self.pinned_candidate() else {
            return;
        };
        if force || self.pinned_timestamp().map_or(true, |cur| candidate > cur) {
            self.store_pinned_timestamp(candidate);
        }
    }

    fn pinned_candidate(&self) -> Option<Timestamp> {
        let mut pinned = self.oldest_timestamp()?;
        if let Some(reader) = self.oldest_reader_timestamp() {
            if reader < pinned {
                pinned = reader;
            }
        }
        Some(pinned)
    }

    // -- per-transaction validation --

    /// Validate a read timestamp against the oldest timestamp.
    ///
    /// Too-old timestamps are rejected, or rounded up to the oldest when
    /// the transaction asked for rounding.
    pub(crate) fn validate_read_timestamp(
        &self,
        ts: Timestamp,
        roundup: bool,
    ) -> Result<Timestamp> {
        if let Some(oldest) = self.oldest_timestamp() {
            if ts < oldest {
                if roundup {
                    return Ok(oldest);
                }
                return Err(BrambleError::invalid_timestamp(format!(
                    "read timestamp {ts} older than oldest timestamp {oldest}"
                )));
            }
        }
        Ok(ts)
    }

    /// Validate a commit timestamp against the global timestamps.
    pub(crate) fn validate_commit_timestamp(&self, ts: Timestamp) -> Result<()> {
        if ts.is_none() {
            return Err(BrambleError::invalid_timestamp(
                "commit timestamp must be non-zero",
            ));
        }
        if let Some(oldest) = self.oldest_timestamp() {
            if ts < oldest {
                return Err(BrambleError::invalid_timestamp(format!(
                    "commit timestamp {ts} older than oldest timestamp {oldest}"
                )));
            }
        }
        if let Some(stable) = self.stable_timestamp() {
            if ts <= stable {
                return Err(BrambleError::invalid_timestamp(format!(
                    "commit timestamp {ts} must be after stable timestamp {stable}"
                )));
            }
        }
        Ok(())
    }

    /// Validate a prepare timestamp, optionally rounding it up to oldest.
    pub(crate) fn validate_prepare_timestamp(
        &self,
        ts: Timestamp,
        roundup: bool,
    ) -> Result<Timestamp> {
        if ts.is_none() {
            return Err(BrambleError::invalid_timestamp(
                "prepare timestamp must be non-zero",
            ));
        }
        if let Some(oldest) = self.oldest_timestamp() {
            if ts < oldest {
                if roundup {
                    return Ok(oldest);
                }
                return Err(BrambleError::invalid_timestamp(format!(
                    "prepare timestamp {ts} older than oldest timestamp {oldest}"
                )));
            }
        }
        Ok(ts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(n)
    }

    #[test]
    fn set_and_query_round_trip() {
        let global = TxnGlobal::new(2);
        global
            .set_timestamps(&GlobalTimestamps {
                durable: Some(ts(30)),
                oldest: Some(ts(10)),
                stable: Some(ts(20)),
                force: false,
            })
            .unwrap();
        assert_eq!(global.query_timestamp(TimestampQuery::AllDurable), Some(ts(30)));
        assert_eq!(global.query_timestamp(TimestampQuery::Oldest), Some(ts(10)));
        assert_eq!(global.query_timestamp(TimestampQuery::Stable), Some(ts(20)));
        assert_eq!(global.query_timestamp(TimestampQuery::Pinned), Some(ts(10)));
    }

    #[test]
    fn empty_update_is_a_no_op() {
        let global = TxnGlobal::new(2);
        global.set_timestamps(&GlobalTimestamps::default()).unwrap();
        assert_eq!(global.query_timestamp(TimestampQuery::Oldest), None);
    }

    #[test]
    fn oldest_beyond_stable_is_rejected() {
        let global = TxnGlobal::new(2);
        let err = global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(25)),
                stable: Some(ts(20)),
                ..GlobalTimestamps::default()
            })
            .unwrap_err();
        assert!(matches!(err, BrambleError::InvalidTimestamp { .. }));

        // Also rejected against a previously set stable.
        global
            .set_timestamps(&GlobalTimestamps {
                stable: Some(ts(20)),
                ..GlobalTimestamps::default()
            })
            .unwrap();
        assert!(global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(25)),
                ..GlobalTimestamps::default()
            })
            .is_err());

        // Force bypasses validation entirely.
        global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(25)),
                force: true,
                ..GlobalTimestamps::default()
            })
            .unwrap();
        assert_eq!(global.query_timestamp(TimestampQuery::Oldest), Some(ts(25)));
    }

    #[test]
    fn backward_moves_are_silently_ignored() {
        let global = TxnGlobal::new(2);
        global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(10)),
                stable: Some(ts(40)),
                ..GlobalTimestamps::default()
            })
            .unwrap();
        global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(5)),
                stable: Some(ts(30)),
                ..GlobalTimestamps::default()
            })
            .unwrap();
        assert_eq!(global.query_timestamp(TimestampQuery::Oldest), Some(ts(10)));
        assert_eq!(global.query_timestamp(TimestampQuery::Stable), Some(ts(40)));
    }

    #[test]
    fn pinned_tracks_active_readers() {
        let global = TxnGlobal::new(4);
        let reader = global.slots.claim().unwrap();
        global
            .slots
            .get(reader)
            .read_timestamp
            .store(7, Ordering::Release);

        global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(10)),
                ..GlobalTimestamps::default()
            })
            .unwrap();
        assert_eq!(global.query_timestamp(TimestampQuery::Pinned), Some(ts(7)));
        assert_eq!(
            global.query_timestamp(TimestampQuery::OldestReader),
            Some(ts(7))
        );

        // Reader leaves: pinned can advance to oldest.
        global
            .slots
            .get(reader)
            .read_timestamp
            .store(0, Ordering::Release);
        global.update_pinned_timestamp(false);
        assert_eq!(global.query_timestamp(TimestampQuery::Pinned), Some(ts(10)));
        assert_eq!(global.query_timestamp(TimestampQuery::OldestReader), None);

        // Pinned never regresses without force.
        global
            .slots
            .get(reader)
            .read_timestamp
            .store(7, Ordering::Release);
        global.update_pinned_timestamp(false);
        assert_eq!(global.query_timestamp(TimestampQuery::Pinned), Some(ts(10)));
        global.update_pinned_timestamp(true);
        assert_eq!(global.query_timestamp(TimestampQuery::Pinned), Some(ts(7)));
    }

    #[test]
    fn oldest_reader_takes_the_minimum() {
        let global = TxnGlobal::new(4);
        let a = global.slots.claim().unwrap();
        let b = global.slots.claim().unwrap();
        global.slots.get(a).read_timestamp.store(9, Ordering::Release);
        global.slots.get(b).read_timestamp.store(4, Ordering::Release);
        assert_eq!(
            global.query_timestamp(TimestampQuery::OldestReader),
            Some(ts(4))
        );
    }

    #[test]
    fn read_timestamp_validation_and_rounding() {
        let global = TxnGlobal::new(2);
        global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(10)),
                ..GlobalTimestamps::default()
            })
            .unwrap();

        assert_eq!(global.validate_read_timestamp(ts(15), false).unwrap(), ts(15));
        assert!(global.validate_read_timestamp(ts(5), false).is_err());
        assert_eq!(global.validate_read_timestamp(ts(5), true).unwrap(), ts(10));
    }

    #[test]
    fn commit_timestamp_validation() {
        let global = TxnGlobal::new(2);
        global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(10)),
                stable: Some(ts(20)),
                ..GlobalTimestamps::default()
            })
            .unwrap();

        assert!(global.validate_commit_timestamp(Timestamp::NONE).is_err());
        assert!(global.validate_commit_timestamp(ts(5)).is_err());
        assert!(global.validate_commit_timestamp(ts(20)).is_err());
        assert!(global.validate_commit_timestamp(ts(21)).is_ok());
    }

    #[test]
    fn prepare_timestamp_validation_and_rounding() {
        let global = TxnGlobal::new(2);
        global
            .set_timestamps(&GlobalTimestamps {
                oldest: Some(ts(10)),
                ..GlobalTimestamps::default()
            })
            .unwrap();

        assert!(global.validate_prepare_timestamp(Timestamp::NONE, false).is_err());
        assert!(global.validate_prepare_timestamp(ts(3), false).is_err());
        assert_eq!(
            global.validate_prepare_timestamp(ts(3), true).unwrap(),
            ts(10)
        );
        assert_eq!(
            global.validate_prepare_timestamp(ts(12), false).unwrap(),
            ts(12)
        );
    }
}

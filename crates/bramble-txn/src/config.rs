//! Begin- and commit-time transaction configuration.

use bramble_error::{BrambleError, Result};
use bramble_types::{IsolationLevel, Timestamp};

// ---------------------------------------------------------------------------
// SyncSetting
// ---------------------------------------------------------------------------

/// Whether commit waits for the log flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncSetting {
    /// Use the table-wide default.
    #[default]
    Inherit,
    /// Flush before commit returns.
    On,
    /// Hand the record to the log and return immediately.
    Off,
}

impl SyncSetting {
    /// Whether the caller explicitly chose a mode.
    #[inline]
    #[must_use]
    pub const fn is_set(self) -> bool {
        !matches!(self, Self::Inherit)
    }
}

// ---------------------------------------------------------------------------
// TxnConfig
// ---------------------------------------------------------------------------

/// Configuration fixed at `begin`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TxnConfig {
    /// Isolation level for the transaction's reads.
    pub isolation: IsolationLevel,
    /// Log flush behavior at commit. May alternatively be set once at
    /// commit time; setting it in both places is rejected.
    pub sync: SyncSetting,
    /// Read past prepared-but-unresolved updates instead of returning a
    /// prepare conflict. Implies the transaction is read-only.
    pub ignore_prepare: bool,
    /// Round a too-old prepare timestamp up to the oldest timestamp
    /// instead of rejecting it.
    pub roundup_prepared: bool,
    /// Round a too-old read timestamp up to the oldest timestamp instead
    /// of rejecting it.
    pub roundup_read: bool,
    /// Fixed point in timestamp-time to read at. Requires snapshot
    /// isolation.
    pub read_timestamp: Option<Timestamp>,
    /// Elapsed running time after which the transaction volunteers itself
    /// to cache-pressure eviction checks. `None` disables the check.
    pub operation_timeout_ms: Option<u64>,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Snapshot,
            sync: SyncSetting::Inherit,
            ignore_prepare: false,
            roundup_prepared: false,
            roundup_read: false,
            read_timestamp: None,
            operation_timeout_ms: None,
        }
    }
}

impl TxnConfig {
    /// Check internal consistency. Called by `begin`.
    pub fn validate(&self) -> Result<()> {
        if self.read_timestamp.is_some() && self.isolation != IsolationLevel::Snapshot {
            return Err(BrambleError::invalid_config(
                "read timestamps require snapshot isolation",
            ));
        }
        if let Some(ts) = self.read_timestamp {
            if ts.is_none() {
                return Err(BrambleError::invalid_config("read timestamp must be non-zero"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommitConfig
// ---------------------------------------------------------------------------

/// Configuration supplied to `commit`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CommitConfig {
    /// Commit timestamp to stamp on every update. Prepared transactions
    /// must supply one.
    pub commit_timestamp: Option<Timestamp>,
    /// Durable timestamp. Only prepared transactions may supply one; it
    /// must not precede the commit timestamp.
    pub durable_timestamp: Option<Timestamp>,
    /// Log flush override. Rejected if `sync` was already set at begin.
    pub sync: SyncSetting,
}

impl CommitConfig {
    /// A commit with a commit timestamp and table-default sync.
    #[must_use]
    pub fn at(commit_timestamp: Timestamp) -> Self {
        Self {
            commit_timestamp: Some(commit_timestamp),
            ..Self::default()
        }
    }

    /// A prepared-transaction commit with explicit durable timestamp.
    #[must_use]
    pub fn prepared(commit_timestamp: Timestamp, durable_timestamp: Timestamp) -> Self {
        Self {
            commit_timestamp: Some(commit_timestamp),
            durable_timestamp: Some(durable_timestamp),
            sync: SyncSetting::Inherit,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

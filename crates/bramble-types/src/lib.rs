//! Shared value types for the BrambleDB transaction table.
//!
//! This crate defines the cross-cutting identifiers and snapshot types used
//! by the MVCC layer: transaction ids with their sentinel values, logical
//! timestamps, record keys, and the [`Snapshot`] read view with its
//! visibility rule.

use std::fmt;

// ---------------------------------------------------------------------------
// TxnId
// ---------------------------------------------------------------------------

/// Monotonically increasing transaction identifier.
///
/// Two raw values are reserved as sentinels and never allocated to a
/// transaction: `0` ([`TxnId::NONE`], "no transaction / slot unused") and
/// `u64::MAX` ([`TxnId::ABORTED`], the tombstone written into update
/// records on rollback). Ids are never recycled within a process lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// "No transaction": unallocated slot fields, unset update owners.
    pub const NONE: Self = Self(0);

    /// First id handed out by a fresh transaction table.
    pub const FIRST: Self = Self(1);

    /// Tombstone owner id written into rolled-back update records.
    pub const ABORTED: Self = Self(u64::MAX);

    /// Construct from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The next id in allocation order.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the [`TxnId::NONE`] sentinel.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether this is a real allocated id (neither sentinel).
    #[inline]
    #[must_use]
    pub const fn is_some(self) -> bool {
        self.0 != 0 && self.0 != u64::MAX
    }

    /// Whether this is the [`TxnId::ABORTED`] tombstone.
    #[inline]
    #[must_use]
    pub const fn is_aborted(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Logical commit/durability timestamp.
///
/// Timestamps are opaque to the table: callers assign them and the table
/// only enforces ordering. `0` means "unset".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The unset timestamp.
    pub const NONE: Self = Self(0);

    /// Construct from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this timestamp is unset.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether this timestamp carries a value.
    #[inline]
    #[must_use]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("ts#none")
        } else {
            write!(f, "ts#{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// RecordKey
// ---------------------------------------------------------------------------

/// Opaque key naming a logical record.
///
/// Collaborating layers (B-tree, replication apply) assign these; the
/// transaction table only uses them to index update chains and to re-locate
/// prepared updates at resolution time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RecordKey(u64);

impl RecordKey {
    /// Construct from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// IsolationLevel
// ---------------------------------------------------------------------------

/// Transaction isolation level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum IsolationLevel {
    /// Reads see every non-aborted update, committed or not.
    ReadUncommitted,
    /// Reads see the latest committed state; each operation may refresh
    /// its snapshot.
    ReadCommitted,
    /// Reads see a single consistent snapshot fixed at begin.
    #[default]
    Snapshot,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadUncommitted => f.write_str("read-uncommitted"),
            Self::ReadCommitted => f.write_str("read-committed"),
            Self::Snapshot => f.write_str("snapshot"),
        }
    }
}

// ---------------------------------------------------------------------------
// PrepareState
// ---------------------------------------------------------------------------

/// Two-phase-commit state of an update record.
///
/// Stored as a `u8` inside atomic update fields; the discriminants are part
/// of that encoding and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum PrepareState {
    /// Not part of a prepared transaction.
    None = 0,
    /// Written by a prepared transaction whose outcome is still pending.
    InProgress = 1,
    /// The prepared transaction has committed or rolled back.
    Resolved = 2,
}

impl PrepareState {
    /// Decode from the raw atomic representation.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range discriminant: the only writers are this
    /// workspace, so a bad value means memory corruption.
    #[inline]
    #[must_use]
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::InProgress,
            2 => Self::Resolved,
            other => panic!("invalid prepare state discriminant: {other}"),
        }
    }

    /// Raw atomic representation.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// UpdateKind
// ---------------------------------------------------------------------------

/// What an update record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UpdateKind {
    /// A value written by the transaction.
    Standard,
    /// A reserved placeholder with no value; switched to aborted when the
    /// owning transaction resolves.
    Reserve,
    /// A deletion marker.
    Tombstone,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A transaction's consistent read view.
///
/// Holds the sorted ids that were concurrently active when the snapshot was
/// taken, together with `snap_min` (smallest id not guaranteed visible) and
/// `snap_max` (the global current id at allocation time, exclusive). The
/// commit generation records when the view was built so unchanged
/// generations can skip re-scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    own_id: TxnId,
    snap_min: TxnId,
    snap_max: TxnId,
    active: Vec<TxnId>,
    generation: u64,
}

impl Snapshot {
    /// Build a snapshot from the collected active ids.
    ///
    /// Sorts `active` ascending (any correct sort satisfies the contract)
    /// and derives `snap_min`: the smallest collected id when one exists and
    /// lies at or below `snap_max`, else `snap_max` itself. An empty scan
    /// yields `snap_min == snap_max`.
    #[must_use]
    pub fn build(own_id: TxnId, mut active: Vec<TxnId>, snap_max: TxnId, generation: u64) -> Self {
        if active.len() > 1 {
            active.sort_unstable();
        }
        let snap_min = match active.first() {
            Some(&first) if first <= snap_max => first,
            _ => snap_max,
        };
        debug_assert!(
            active.is_empty() || !snap_min.is_none(),
            "non-empty snapshot must have a real snap_min"
        );
        Self {
            own_id,
            snap_min,
            snap_max,
            active,
            generation,
        }
    }

    /// An empty view that sees everything up to `snap_max`.
    #[must_use]
    pub fn empty(own_id: TxnId, snap_max: TxnId, generation: u64) -> Self {
        Self::build(own_id, Vec::new(), snap_max, generation)
    }

    /// Smallest id not guaranteed visible.
    #[inline]
    #[must_use]
    pub const fn snap_min(&self) -> TxnId {
        self.snap_min
    }

    /// Exclusive upper bound: the global current id at allocation time.
    #[inline]
    #[must_use]
    pub const fn snap_max(&self) -> TxnId {
        self.snap_max
    }

    /// The owning transaction's id at allocation time (possibly `NONE`).
    #[inline]
    #[must_use]
    pub const fn own_id(&self) -> TxnId {
        self.own_id
    }

    /// Commit generation the snapshot was taken at.
    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The sorted concurrently-active ids.
    #[must_use]
    pub fn active_ids(&self) -> &[TxnId] {
        &self.active
    }

    /// Number of concurrently-active ids captured.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether `id` was captured as concurrently active.
    #[must_use]
    pub fn contains(&self, id: TxnId) -> bool {
        self.active.binary_search(&id).is_ok()
    }

    /// The snapshot visibility rule.
    ///
    /// `id` is visible iff it is `NONE` (updates without an owner are
    /// globally visible), or the viewer's own id, or below `snap_min`, or
    /// below `snap_max` and not captured in the active array. `ABORTED` is
    /// never visible.
    #[must_use]
    pub fn is_visible(&self, id: TxnId) -> bool {
        if id.is_none() {
            return true;
        }
        if id.is_aborted() {
            return false;
        }
        if !self.own_id.is_none() && id == self.own_id {
            return true;
        }
        if id < self.snap_min {
            return true;
        }
        id < self.snap_max && !self.contains(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

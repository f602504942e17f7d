//! Per-session transaction slots and the shared slot array.
//!
//! Every open session owns one [`TxnSlot`]. A slot publishes the session's
//! running transaction id and pinned snapshot bounds so that concurrent
//! snapshot and oldest-id scans can read them without taking any lock. A
//! slot with `id == 0` has no running transaction.
//!
//! # Cache-Line Size
//!
//! We assume 64-byte cache lines (standard on x86-64 and AArch64). Each
//! slot occupies exactly one line so scans by other threads never falsely
//! share with the owner's writes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bramble_types::TxnId;

/// Cache line size in bytes.
pub const CACHE_LINE_BYTES: usize = 64;

/// Slot scans CAS and publish 64-bit words; platforms without native 64-bit
/// atomics cannot keep the id protocol lock-free.
#[cfg(not(target_has_atomic = "64"))]
compile_error!("BrambleDB requires 64-bit atomics (target_has_atomic = \"64\").");

// ---------------------------------------------------------------------------
// TxnSlot
// ---------------------------------------------------------------------------

/// Shared transaction slot, exactly one cache line.
///
/// Fields are written only by the owning session but read by every
/// concurrent scan, so all of them are atomics:
///
/// - `id`: the running transaction's id, or 0 when idle. During id
///   allocation the owner publishes the current global id here as a
///   provisional value with `is_allocating` set, then overwrites it with
///   the real allocated id and clears `is_allocating`. Scans that observe
///   `is_allocating` must wait and re-read.
/// - `pinned_id`: the snapshot's `snap_min`, or 0 when the session holds
///   no snapshot. This is what keeps old versions alive.
/// - `metadata_pinned`: floor pinned on behalf of an open checkpoint
///   cursor, or 0.
/// - `read_timestamp`: published read timestamp, or 0; feeds the
///   oldest-reader query.
#[repr(C, align(64))]
pub struct TxnSlot {
    /// Running transaction id. 0 = none.
    pub id: AtomicU64,
    /// Oldest id the session's snapshot treats as unresolved. 0 = no
    /// snapshot.
    pub pinned_id: AtomicU64,
    /// Checkpoint-snapshot floor pinned by this session. 0 = none.
    pub metadata_pinned: AtomicU64,
    /// Published read timestamp. 0 = none.
    pub read_timestamp: AtomicU64,
    /// True while the owner is mid-allocation and `id` is provisional.
    pub is_allocating: AtomicBool,
    /// True while a session owns this slot.
    claimed: AtomicBool,
    /// Padding to the end of the cache line.
    _pad: [u8; CACHE_LINE_BYTES - 4 * 8 - 2],
}

impl TxnSlot {
    /// Create a free slot with all fields cleared.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            pinned_id: AtomicU64::new(0),
            metadata_pinned: AtomicU64::new(0),
            read_timestamp: AtomicU64::new(0),
            is_allocating: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            _pad: [0; CACHE_LINE_BYTES - 4 * 8 - 2],
        }
    }

    /// The published transaction id, if any.
    #[inline]
    #[must_use]
    pub fn running_id(&self, ordering: Ordering) -> TxnId {
        TxnId::new(self.id.load(ordering))
    }

    /// Whether some transaction has published an id in this slot.
    #[inline]
    #[must_use]
    pub fn has_running_txn(&self, ordering: Ordering) -> bool {
        self.id.load(ordering) != 0
    }

    /// Whether a session currently owns this slot.
    #[inline]
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Drop the published snapshot pin.
    #[inline]
    pub fn clear_pinned(&self) {
        self.pinned_id.store(0, Ordering::Release);
    }

    /// Clear every published field.
    ///
    /// `id` is stored last with `Release` ordering: a scan that still sees
    /// the old id also sees pins at least as conservative as the ones that
    /// id published, so it can never resurrect a stale view.
    pub fn clear_all(&self) {
        self.pinned_id.store(0, Ordering::Relaxed);
        self.metadata_pinned.store(0, Ordering::Relaxed);
        self.read_timestamp.store(0, Ordering::Relaxed);
        self.is_allocating.store(false, Ordering::Relaxed);
        self.id.store(0, Ordering::Release);
    }
}

impl Default for TxnSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TxnSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnSlot")
            .field("id", &self.id.load(Ordering::Relaxed))
            .field("pinned_id", &self.pinned_id.load(Ordering::Relaxed))
            .field(
                "metadata_pinned",
                &self.metadata_pinned.load(Ordering::Relaxed),
            )
            .field(
                "read_timestamp",
                &self.read_timestamp.load(Ordering::Relaxed),
            )
            .field(
                "is_allocating",
                &self.is_allocating.load(Ordering::Relaxed),
            )
            .field("claimed", &self.claimed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SlotArray
// ---------------------------------------------------------------------------

/// Fixed-capacity array of transaction slots.
///
/// Sessions claim a slot at open and keep it until close; scans walk every
/// slot unconditionally, claimed or not, because an unclaimed slot always
/// reads as idle.
pub struct SlotArray {
    slots: Box<[TxnSlot]>,
}

impl SlotArray {
    /// Allocate `capacity` free slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SlotArray::new: capacity must be non-zero");
        let slots: Vec<TxnSlot> = (0..capacity).map(|_| TxnSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot for a new session, returning its index.
    ///
    /// Returns `None` when every slot is owned.
    #[must_use]
    pub fn claim(&self) -> Option<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    /// Return a claimed slot to the free pool.
    ///
    /// # Panics
    ///
    /// Panics if the slot was not claimed or still publishes a running
    /// transaction; releasing an active slot would silently unpin the
    /// global table.
    pub fn unclaim(&self, idx: usize) {
        let slot = &self.slots[idx];
        assert!(
            !slot.has_running_txn(Ordering::Acquire),
            "SlotArray::unclaim: slot {idx} still has a running transaction"
        );
        slot.clear_all();
        let was_claimed = slot.claimed.swap(false, Ordering::AcqRel);
        assert!(was_claimed, "SlotArray::unclaim: slot {idx} was not claimed");
    }

    /// Borrow a slot by index.
    #[inline]
    #[must_use]
    pub fn get(&self, idx: usize) -> &TxnSlot {
        &self.slots[idx]
    }

    /// Iterate over every slot.
    pub fn iter(&self) -> impl Iterator<Item = &TxnSlot> {
        self.slots.iter()
    }

    /// Number of currently claimed slots.
    #[must_use]
    pub fn claimed_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_claimed()).count()
    }
}

impl std::fmt::Debug for SlotArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotArray")
            .field("capacity", &self.capacity())
            .field("claimed", &self.claimed_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

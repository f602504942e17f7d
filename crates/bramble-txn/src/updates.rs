//! Update records, the update arena, and per-key update chains.
//!
//! Every write publishes an [`UpdateRecord`] at the head of its key's
//! chain, newest first. Records are shared (`Arc`) because commit and
//! rollback finalize their fields while concurrent readers are still
//! walking the chain; every field a finalizer touches is atomic, and the
//! chain link itself is immutable once published.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use bramble_error::{BrambleError, Result};
use bramble_types::{IsolationLevel, PrepareState, RecordKey, Snapshot, Timestamp, TxnId, UpdateKind};

// ---------------------------------------------------------------------------
// UpdateIdx / UpdateArena
// ---------------------------------------------------------------------------

/// Index into an [`UpdateArena`] chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateIdx {
    chunk: u32,
    offset: u32,
}

impl UpdateIdx {
    #[inline]
    pub(crate) const fn new(chunk: u32, offset: u32) -> Self {
        Self { chunk, offset }
    }

    /// Chunk index within the arena.
    #[inline]
    #[must_use]
    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Offset within the chunk.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Number of update records per arena chunk.
const ARENA_CHUNK: usize = 4096;

/// Bump-allocated arena for [`UpdateRecord`] objects.
///
/// Single-writer / multi-reader. The arena owns the `Arc` roots and hands
/// out [`UpdateIdx`] handles; freed slots are recycled via a free list.
/// Readers that cloned an `Arc` keep the record alive past `free`.
pub struct UpdateArena {
    chunks: Vec<Vec<Option<Arc<UpdateRecord>>>>,
    free_list: Vec<UpdateIdx>,
    high_water: u64,
}

impl UpdateArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: vec![Vec::with_capacity(ARENA_CHUNK)],
            free_list: Vec::new(),
            high_water: 0,
        }
    }

    /// Allocate a slot for `record`, returning its index.
    pub fn alloc(&mut self, record: UpdateRecord) -> UpdateIdx {
        let record = Arc::new(record);
        if let Some(idx) = self.free_list.pop() {
            self.chunks[idx.chunk as usize][idx.offset as usize] = Some(record);
            return idx;
        }

        let last_chunk = self.chunks.len() - 1;
        if self.chunks[last_chunk].len() >= ARENA_CHUNK {
            self.chunks.push(Vec::with_capacity(ARENA_CHUNK));
        }

        let chunk_idx = self.chunks.len() - 1;
        let offset = self.chunks[chunk_idx].len();
        self.chunks[chunk_idx].push(Some(record));
        self.high_water += 1;

        let chunk_u32 = u32::try_from(chunk_idx).expect("UpdateArena chunk index overflow u32");
        let offset_u32 = u32::try_from(offset).expect("UpdateArena offset overflow u32");
        UpdateIdx::new(chunk_u32, offset_u32)
    }

    /// Free the slot at `idx`, making it available for reuse.
    ///
    /// # Panics
    ///
    /// Asserts that the slot is currently occupied (catches double-free).
    pub fn free(&mut self, idx: UpdateIdx) {
        let slot = &mut self.chunks[idx.chunk as usize][idx.offset as usize];
        assert!(slot.is_some(), "UpdateArena::free: double-free of {idx:?}");
        *slot = None;
        self.free_list.push(idx);
    }

    /// Look up a record by index.
    #[must_use]
    pub fn get(&self, idx: UpdateIdx) -> Option<Arc<UpdateRecord>> {
        self.chunks
            .get(idx.chunk as usize)?
            .get(idx.offset as usize)?
            .clone()
    }

    /// Total records ever allocated (including freed).
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Number of slots on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}

impl Default for UpdateArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UpdateArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateArena")
            .field("chunk_count", &self.chunks.len())
            .field("free_count", &self.free_list.len())
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// UpdateRecord
// ---------------------------------------------------------------------------

/// One version of one key.
///
/// `kind`, `value`, and `next` are fixed at publish time. The owner id,
/// timestamps, and prepare state are finalized later by commit, prepare,
/// or rollback while readers may hold the record, so they are atomics; a
/// reader loads each field at most once per walk and tolerates seeing a
/// record transition underneath it.
pub struct UpdateRecord {
    txn_id: AtomicU64,
    start_ts: AtomicU64,
    durable_ts: AtomicU64,
    prepare_state: AtomicU8,
    kind: UpdateKind,
    value: Option<Vec<u8>>,
    next: Option<UpdateIdx>,
}

impl UpdateRecord {
    /// Create a record owned by `owner`, linked to the previous chain head.
    #[must_use]
    pub fn new(
        owner: TxnId,
        kind: UpdateKind,
        value: Option<Vec<u8>>,
        next: Option<UpdateIdx>,
    ) -> Self {
        Self {
            txn_id: AtomicU64::new(owner.get()),
            start_ts: AtomicU64::new(0),
            durable_ts: AtomicU64::new(0),
            prepare_state: AtomicU8::new(PrepareState::None.as_u8()),
            kind,
            value,
            next,
        }
    }

    /// Current owner id. `ABORTED` once rolled back, `NONE` once made
    /// globally visible.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> TxnId {
        TxnId::new(self.txn_id.load(Ordering::Acquire))
    }

    /// Overwrite the owner id.
    #[inline]
    pub fn set_owner(&self, owner: TxnId) {
        self.txn_id.store(owner.get(), Ordering::Release);
    }

    /// Commit timestamp, or the prepare timestamp while prepared.
    #[inline]
    #[must_use]
    pub fn start_ts(&self) -> Timestamp {
        Timestamp::new(self.start_ts.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_start_ts(&self, ts: Timestamp) {
        self.start_ts.store(ts.get(), Ordering::Release);
    }

    /// Durable timestamp stamped at commit.
    #[inline]
    #[must_use]
    pub fn durable_ts(&self) -> Timestamp {
        Timestamp::new(self.durable_ts.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_durable_ts(&self, ts: Timestamp) {
        self.durable_ts.store(ts.get(), Ordering::Release);
    }

    /// Two-phase-commit state.
    #[inline]
    #[must_use]
    pub fn prepare_state(&self) -> PrepareState {
        PrepareState::from_u8(self.prepare_state.load(Ordering::Acquire))
    }

    /// Publish a prepare-state transition. `Release` so a reader that
    /// observes the new state also observes the timestamps written before
    /// it.
    #[inline]
    pub fn set_prepare_state(&self, state: PrepareState) {
        self.prepare_state.store(state.as_u8(), Ordering::Release);
    }

    /// What this record represents.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    /// The written value. `None` for reservations and tombstones.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Link to the next-older record in the chain.
    #[inline]
    #[must_use]
    pub fn next(&self) -> Option<UpdateIdx> {
        self.next
    }
}

impl std::fmt::Debug for UpdateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateRecord")
            .field("owner", &self.owner())
            .field("start_ts", &self.start_ts())
            .field("durable_ts", &self.durable_ts())
            .field("prepare_state", &self.prepare_state())
            .field("kind", &self.kind)
            .field("has_value", &self.value.is_some())
            .field("next", &self.next)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RecordKey hasher (identity-hash for u64 keys)
// ---------------------------------------------------------------------------

/// Fast identity hasher for `RecordKey` keys in the chain table.
///
/// Record keys are already well-distributed u64 values, so we skip hashing
/// entirely and use the raw value directly.
#[derive(Default)]
struct RecordKeyHasher(u64);

impl Hasher for RecordKeyHasher {
    fn write(&mut self, _: &[u8]) {
        debug_assert!(false, "RecordKeyHasher only supports write_u64");
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type RecordKeyBuildHasher = BuildHasherDefault<RecordKeyHasher>;

// ---------------------------------------------------------------------------
// ReadView
// ---------------------------------------------------------------------------

/// Everything a chain walk needs to decide visibility.
///
/// Built by the session from the transaction's isolation level, snapshot,
/// and read timestamp.
#[derive(Debug, Clone, Copy)]
pub struct ReadView<'a> {
    /// Isolation level governing the walk.
    pub isolation: IsolationLevel,
    /// Snapshot for the id check. Required unless reading uncommitted.
    pub snapshot: Option<&'a Snapshot>,
    /// Upper bound on visible start timestamps, if the transaction reads
    /// at a fixed point in timestamp-time.
    pub read_timestamp: Option<Timestamp>,
    /// The reading transaction's own id, or `NONE`.
    pub own_id: TxnId,
    /// Skip prepared-but-unresolved updates instead of conflicting.
    pub ignore_prepare: bool,
}

impl ReadView<'_> {
    /// Whether a record with this owner and start timestamp is visible.
    ///
    /// Own writes are always visible regardless of timestamps. Updates
    /// with no timestamp are visible at every read timestamp.
    fn is_visible(&self, owner: TxnId, start_ts: Timestamp) -> bool {
        if owner.is_aborted() {
            return false;
        }
        if !self.own_id.is_none() && owner == self.own_id {
            return true;
        }
        let id_visible = match self.isolation {
            IsolationLevel::ReadUncommitted => true,
            IsolationLevel::ReadCommitted | IsolationLevel::Snapshot => self
                .snapshot
                .map_or(owner.is_none(), |snap| snap.is_visible(owner)),
        };
        if !id_visible {
            return false;
        }
        self.read_timestamp.map_or(true, |read_ts| start_ts <= read_ts)
    }
}

// ---------------------------------------------------------------------------
// UpdateStore
// ---------------------------------------------------------------------------

/// The shared store: arena plus the per-key chain-head table.
///
/// Lock order is chain table before arena; nothing holds both write locks
/// except `publish` and `drop_chain`.
pub struct UpdateStore {
    chains: RwLock<HashMap<RecordKey, UpdateIdx, RecordKeyBuildHasher>>,
    arena: RwLock<UpdateArena>,
}

impl UpdateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(HashMap::with_hasher(RecordKeyBuildHasher::default())),
            arena: RwLock::new(UpdateArena::new()),
        }
    }

    /// Publish a new record at the head of `key`'s chain.
    ///
    /// Returns the record's index. The chain lock is held across the
    /// allocation so the `next` link can never skip a concurrent publish.
    pub fn publish(
        &self,
        key: RecordKey,
        owner: TxnId,
        kind: UpdateKind,
        value: Option<Vec<u8>>,
    ) -> UpdateIdx {
        let mut chains = self.chains.write();
        let prev_head = chains.get(&key).copied();
        let idx = self
            .arena
            .write()
            .alloc(UpdateRecord::new(owner, kind, value, prev_head));
        chains.insert(key, idx);
        debug!(
            key = %key,
            owner = %owner,
            chunk = idx.chunk(),
            offset = idx.offset(),
            "published update"
        );
        idx
    }

    /// Head of `key`'s chain, if any.
    #[must_use]
    pub fn head(&self, key: RecordKey) -> Option<UpdateIdx> {
        self.chains.read().get(&key).copied()
    }

    /// Look up a record by index.
    #[must_use]
    pub fn get(&self, idx: UpdateIdx) -> Option<Arc<UpdateRecord>> {
        self.arena.read().get(idx)
    }

    /// Walk `key`'s chain newest-first and return the first record visible
    /// to `view`.
    ///
    /// Rolled-back records are skipped. A record that would be visible but
    /// belongs to an unresolved prepared transaction yields
    /// [`BrambleError::PrepareConflict`], unless the view ignores prepares,
    /// in which case the walk continues to the next-older record.
    pub fn visible_update(
        &self,
        key: RecordKey,
        view: &ReadView<'_>,
    ) -> Result<Option<Arc<UpdateRecord>>> {
        let mut cursor = self.head(key);
        while let Some(idx) = cursor {
            let Some(record) = self.get(idx) else {
                break;
            };
            let owner = record.owner();
            let start_ts = record.start_ts();
            if view.is_visible(owner, start_ts) {
                if record.prepare_state() == PrepareState::InProgress
                    && (view.own_id.is_none() || owner != view.own_id)
                {
                    if view.ignore_prepare {
                        cursor = record.next();
                        continue;
                    }
                    return Err(BrambleError::PrepareConflict);
                }
                // Reservations carry no value; even their owner reads
                // through them to the record underneath.
                if record.kind() == UpdateKind::Reserve {
                    cursor = record.next();
                    continue;
                }
                return Ok(Some(record));
            }
            cursor = record.next();
        }
        Ok(None)
    }

    /// First-updater-wins conflict check for a transaction about to write
    /// `key`.
    ///
    /// The newest record that has not been rolled back decides: the
    /// writer's own record or a record visible to its view is fine, while
    /// an invisible concurrent record or an unresolved prepared record is a
    /// conflict. Conflicts are [`BrambleError::RollbackRequired`]; the
    /// losing transaction must roll back, there is nothing to wait for.
    /// The check is id-based only: a record committed beyond the writer's
    /// read timestamp is caught by commit-time per-key validation instead.
    pub fn check_write_conflict(&self, key: RecordKey, view: &ReadView<'_>) -> Result<()> {
        let mut cursor = self.head(key);
        while let Some(idx) = cursor {
            let Some(record) = self.get(idx) else {
                break;
            };
            let owner = record.owner();
            if owner.is_aborted() {
                cursor = record.next();
                continue;
            }
            if !view.own_id.is_none() && owner == view.own_id {
                return Ok(());
            }
            if record.prepare_state() == PrepareState::InProgress {
                return Err(BrambleError::rollback_required(
                    "write conflict with a prepared transaction",
                ));
            }
            let visible = match view.isolation {
                IsolationLevel::ReadUncommitted => true,
                IsolationLevel::ReadCommitted | IsolationLevel::Snapshot => view
                    .snapshot
                    .map_or(owner.is_none(), |snap| snap.is_visible(owner)),
            };
            if !visible {
                return Err(BrambleError::rollback_required(
                    "write conflict with a concurrent update",
                ));
            }
            return Ok(());
        }
        Ok(())
    }

    /// Number of records in `key`'s chain.
    ///
    /// The chain head is sampled before the arena guard is taken, keeping
    /// the chains-before-arena lock order; records published after the
    /// sample are not counted.
    #[must_use]
    pub fn chain_len(&self, key: RecordKey) -> usize {
        let mut cursor = self.head(key);
        let arena = self.arena.read();
        let mut len = 0;
        while let Some(idx) = cursor {
            len += 1;
            cursor = arena.get(idx).and_then(|rec| rec.next());
        }
        len
    }

    /// Number of keys with a chain.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.chains.read().len()
    }

    /// Drop `key`'s entire chain and free its arena slots.
    ///
    /// Caller must guarantee no transaction can still re-locate records
    /// under this key; in-flight readers holding `Arc`s remain safe.
    pub fn drop_chain(&self, key: RecordKey) {
        let mut chains = self.chains.write();
        let Some(head) = chains.remove(&key) else {
            return;
        };
        let mut arena = self.arena.write();
        let mut cursor = Some(head);
        while let Some(idx) = cursor {
            cursor = arena.get(idx).and_then(|rec| rec.next());
            arena.free(idx);
        }
    }

    /// Total records ever allocated.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.arena.read().high_water()
    }
}

impl Default for UpdateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UpdateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateStore")
            .field("key_count", &self.key_count())
            .field("arena", &*self.arena.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! MVCC transaction table: ids, snapshots, timestamps, and the commit
//! protocols that tie them together.
//!
//! The table tracks every running transaction in a fixed array of
//! cache-line-sized slots. Snapshots are allocated by walking the slots,
//! waiting out ids caught mid-allocation; the oldest-id scan walks the same
//! slots to find the horizon below which old versions are reclaimable.
//! Sessions drive transactions through begin, optional two-phase prepare,
//! and commit or rollback, with commit-time timestamp validation against
//! the global oldest and stable timestamps.
//!
//! [`TxnTable`] is the entry point; [`Session`] does the work.

pub mod config;
pub mod global;
mod lifecycle;
mod oldest;
pub mod session;
pub mod slot;
mod snapshot;
pub mod stats;
pub mod table;
pub mod timestamps;
pub mod updates;

pub use config::{CommitConfig, SyncSetting, TxnConfig};
pub use global::TxnGlobal;
pub use session::Session;
pub use slot::{SlotArray, TxnSlot, CACHE_LINE_BYTES};
pub use stats::{SlotDump, TxnStats, TxnStatsSnapshot, TxnTableDump};
pub use table::TxnTable;
pub use timestamps::{GlobalTimestamps, TimestampQuery};
pub use updates::{ReadView, UpdateIdx, UpdateRecord, UpdateStore};

pub use bramble_error::{BrambleError, ErrorCode, Result};
pub use bramble_types::{
    IsolationLevel, PrepareState, RecordKey, Snapshot, Timestamp, TxnId, UpdateKind,
};

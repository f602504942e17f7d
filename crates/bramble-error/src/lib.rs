use thiserror::Error;

/// Primary error type for BrambleDB transaction-table operations.
///
/// Structured variants for the cases callers are expected to match on, with
/// recovery hints for the user-facing ones. Internal invariant violations
/// are deliberately not represented here: a broken global-table invariant
/// means shared state is corrupt and the process panics instead of
/// returning an error it cannot honor.
#[derive(Error, Debug)]
pub enum BrambleError {
    // === Timestamp Errors ===
    /// A commit, durable, or prepare timestamp failed validation.
    #[error("invalid timestamp: {reason}")]
    InvalidTimestamp { reason: String },

    // === Concurrency Errors ===
    /// A lock or resource was unavailable and the caller asked not to wait.
    #[error("transaction table is busy")]
    Busy,

    /// A read hit an update owned by a prepared but unresolved transaction.
    #[error("prepare conflict: update belongs to an unresolved prepared transaction")]
    PrepareConflict,

    /// The transaction is pinning global resources and must roll back.
    #[error("transaction requires rollback: {reason}")]
    RollbackRequired { reason: String },

    // === Configuration Errors ===
    /// A begin or commit configuration was rejected.
    #[error("invalid transaction configuration: {reason}")]
    InvalidConfig { reason: String },

    /// All transaction slots are claimed.
    #[error("no transaction slots available (capacity {capacity})")]
    SlotsExhausted { capacity: usize },
}

/// Stable numeric codes for logs and embedding APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Invalid argument or configuration.
    Invalid = 1,
    /// Resource busy; retry later.
    Busy = 2,
    /// Prepared-transaction conflict; retry after resolution.
    PrepareConflict = 3,
    /// Transaction must be rolled back by the caller.
    Rollback = 4,
    /// Capacity exhausted.
    Full = 5,
}

impl BrambleError {
    /// Map this error to its stable numeric code.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidTimestamp { .. } | Self::InvalidConfig { .. } => ErrorCode::Invalid,
            Self::Busy => ErrorCode::Busy,
            Self::PrepareConflict => ErrorCode::PrepareConflict,
            Self::RollbackRequired { .. } => ErrorCode::Rollback,
            Self::SlotsExhausted { .. } => ErrorCode::Full,
        }
    }

    /// Whether retrying the same call later may succeed without other
    /// changes by the caller.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::PrepareConflict)
    }

    /// Whether the transaction itself is still usable after this error.
    ///
    /// Timestamp and configuration rejections leave the transaction
    /// running; the caller can fix the arguments and try again. A required
    /// rollback does not.
    pub const fn leaves_transaction_usable(&self) -> bool {
        matches!(
            self,
            Self::InvalidTimestamp { .. }
                | Self::InvalidConfig { .. }
                | Self::Busy
                | Self::PrepareConflict
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidTimestamp { .. } => {
                Some("Choose a timestamp consistent with the key's existing history")
            }
            Self::Busy => Some("Retry the operation after a short delay"),
            Self::PrepareConflict => {
                Some("Wait for the prepared transaction to resolve, then retry the read")
            }
            Self::RollbackRequired { .. } => {
                Some("Roll back this transaction and begin a new one")
            }
            Self::SlotsExhausted { .. } => {
                Some("Close an idle session or open the table with more slots")
            }
            Self::InvalidConfig { .. } => None,
        }
    }

    /// Create a timestamp validation error.
    pub fn invalid_timestamp(reason: impl Into<String>) -> Self {
        Self::InvalidTimestamp {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a rollback-required advisory error.
    pub fn rollback_required(reason: impl Into<String>) -> Self {
        Self::RollbackRequired {
            reason: reason.into(),
        }
    }
}

/// Result type alias using `BrambleError`.
pub type Result<T> = std::result::Result<T, BrambleError>;

use rust_decimal::Decimal;

/// Error taxonomy for ledger operations. Validation, authorization and
/// state-conflict errors are never retried; `Transient` is retried by the
/// service layer before being surfaced.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock for '{item}': requested {requested}, available {available}")]
    InsufficientStock {
        item: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("state conflict on record {id}: expected {expected}, found {found}")]
    StateConflict {
        id: String,
        expected: String,
        found: String,
    },

    #[error("version {version} of chain {chain} was claimed by a concurrent edit")]
    VersionConflict { chain: String, version: u32 },

    #[error("{actor} lacks the privilege required to {action}")]
    Unauthorized { actor: String, action: String },

    // the field holding the conflicting population must not be called
    // `source`; thiserror reserves that name for error chaining
    #[error("room {room} is unavailable: occupied by {occupied_by} {record_id} (guest {guest_name})")]
    RoomUnavailable {
        room: String,
        occupied_by: String,
        record_id: String,
        guest_name: String,
    },

    #[error("session invalid: {0}")]
    Transient(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl LedgerError {
    /// Only transient (expired-credential) failures qualify for the write
    /// retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

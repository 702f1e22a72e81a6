use thiserror::Error;

/// Error taxonomy for the storage and query core.
///
/// `Io` and `Corruption` originate below the record layer; everything else is
/// raised while planning or executing a statement. A failed statement aborts
/// its implicit transaction; inside an explicit transaction the rollback path
/// discards the write set.
#[derive(Debug, Error)]
pub enum NovusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum, magic, or version mismatch on read. The handle should be
    /// reopened; recovery will replay the WAL.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// Unknown collection/field/index, duplicate create, or drop of a
    /// non-existent object without IF EXISTS.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Nested BEGIN, or COMMIT/ROLLBACK without an active transaction.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Reserved: the single-writer model has no user-visible serialization
    /// conflicts today.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Record location does not resolve to a live record.
    #[error("record not found")]
    NotFound,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

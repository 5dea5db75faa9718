use thiserror::Error;

use satchel_shared::constants::MAX_AVATAR_BYTES;

/// Everything that can go wrong in the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying SQLite operation failed.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The conversation or message a query asked for does not exist.
    #[error("Record not found")]
    NotFound,

    /// A stored record does not have the shape the operation requires,
    /// e.g. a group operation on a 1:1 thread.
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// Group avatar over the size cap.
    #[error("Avatar exceeds {MAX_AVATAR_BYTES} bytes")]
    AvatarTooLarge,

    /// A schema migration did not apply cleanly.
    #[error("Migration error: {0}")]
    Migration(String),

    /// No platform data directory could be resolved for the database file.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Filesystem error around the database file or its directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A background storage task was cancelled or panicked.
    #[error("Storage task failed: {0}")]
    Task(String),

    // Column decoding failures on read paths.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// JSON (de)serialization error for JSON-snapshot columns.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

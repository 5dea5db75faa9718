use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the chat layer.
#[derive(Error, Debug)]
pub enum ChatError {
    /// An operation was invoked before [`crate::session::ChatSession`]
    /// finished initializing, or after it was cleared.
    #[error("Chat session is not initialized")]
    Uninitialized,

    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] satchel_store::StoreError),

    /// The transport rejected or failed an operation.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload (de)serialization failed.
    #[error("Payload error: {0}")]
    Payload(#[from] satchel_shared::PayloadError),

    /// Preference storage failed.
    #[error("Preference store error: {0}")]
    Prefs(String),

    /// A request that does not make sense for the targeted conversation,
    /// e.g. a group operation aimed at a 1:1 thread.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The in-process task backing an operation went away.
    #[error("Chat task failed: {0}")]
    Task(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;

//! # satchel-store
//!
//! Local persistence for the Satchel messenger, backed by SQLite.
//!
//! The crate exposes two layers: a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed query helpers, and the async
//! [`ConversationStore`] on top of it, which serializes writes on the
//! blocking pool and broadcasts change events to subscribers after each
//! transaction commits.

pub mod conversation_store;
pub mod conversations;
pub mod database;
pub mod migrations;
pub mod models;

mod error;

pub use conversation_store::{ConversationEvents, ConversationStore};
pub use database::Database;
pub use error::StoreError;
pub use models::*;

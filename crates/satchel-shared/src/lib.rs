//! # satchel-shared
//!
//! Building blocks shared by every satchel crate: identifier newtypes, the
//! Ed25519 device identity, the application-level message payload codec, and
//! the common error types.
//!
//! Nothing in this crate talks to the network or touches disk; it is pure
//! data and crypto primitives.

pub mod constants;
pub mod identity;
pub mod payload;
pub mod types;

mod error;

pub use error::{IdentityError, PayloadError};
pub use types::{Address, GroupId, ThreadId};

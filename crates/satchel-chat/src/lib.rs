//! # satchel-chat
//!
//! The messaging core: outbound dispatch, the inbound envelope pump and
//! device registration, tied together by the [`ChatSession`] facade on top
//! of the `satchel-store` conversation store. The connection to the chat
//! backend is pluggable through the [`Transport`] trait; [`memory`] ships
//! an in-process hub implementation for tests and local development.

pub mod config;
pub mod memory;
pub mod notifications;
pub mod prefs;
pub mod receiver;
pub mod registration;
pub mod sender;
pub mod session;
pub mod transport;

mod error;

pub use config::SessionConfig;
pub use error::ChatError;
pub use receiver::IncomingMessage;
pub use registration::RegistrationState;
pub use sender::{GroupUpdate, GroupUpdateOutcome, MessageTask, SubstepOutcome};
pub use session::ChatSession;
pub use transport::{DeviceCredentials, Transport, TransportError};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("satchel_chat=debug,satchel_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

//! Transport abstraction over the chat backend.
//!
//! The transport owns the encrypted signaling protocol, addressing and
//! delivery; this crate only hands it opaque envelopes. One transport
//! instance belongs to one device. Production builds plug in the real
//! backend client; tests use the in-memory hub from [`crate::memory`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use chrono::{DateTime, Utc};
use satchel_shared::payload::{InboundEnvelope, OutboundEnvelope};
use satchel_shared::{Address, GroupId};

/// Errors produced by transport implementations.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The transport cannot currently reach the chat backend.
    #[error("Not connected to the chat server")]
    Disconnected,

    /// The backend refused the request.
    #[error("Chat server rejected the request: {0}")]
    Rejected(String),

    /// Delivery or I/O failure on the wire.
    #[error("Network failure: {0}")]
    Network(String),
}

/// Authentication material a device presents when registering.
///
/// Everything here is derived deterministically from the identity, which is
/// what keeps registration idempotent at the backend: a re-install derives
/// the same credentials and simply re-claims its account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub address: Address,
    /// Hex-encoded per-device password.
    pub password: String,
    /// Base64 key the backend uses to wrap push payloads.
    pub signaling_key: String,
    /// Numeric id distinguishing re-installs of the same account.
    pub registration_id: u32,
}

/// Backend acknowledgment of a completed registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationReceipt {
    pub address: Address,
    pub registered_at: DateTime<Utc>,
}

/// A connection to the chat backend.
///
/// Implementations must be shareable across tasks; every method takes
/// `&self` and the returned futures are `Send`.
pub trait Transport: Send + Sync + 'static {
    /// Register this device with the backend. Idempotent for the same
    /// credentials.
    fn register(
        &self,
        credentials: &DeviceCredentials,
    ) -> impl std::future::Future<Output = Result<RegistrationReceipt, TransportError>> + Send;

    /// Deliver an envelope to a single recipient.
    fn send(
        &self,
        recipient: &Address,
        envelope: OutboundEnvelope,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Deliver an envelope to every listed group member.
    fn send_to_group(
        &self,
        members: &[Address],
        envelope: OutboundEnvelope,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Allocate a fresh group id on the backend.
    fn allocate_group(
        &self,
    ) -> impl std::future::Future<Output = Result<GroupId, TransportError>> + Send;

    /// Wait for the next inbound envelope. `None` means the stream closed
    /// and no further envelopes will arrive.
    fn next_envelope(
        &self,
    ) -> impl std::future::Future<Output = Option<InboundEnvelope>> + Send;

    /// Register a push token so the backend can wake this device.
    fn register_push_token(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Remove this device's push token from the backend.
    fn unregister_push_token(
        &self,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Connectivity signal: `true` while the transport believes it can
    /// reach the backend. The session re-drives registration on the
    /// offline-to-online edge.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

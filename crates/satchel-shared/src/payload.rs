//! Application-level message payloads.
//!
//! A payload is the body of a chat message: what the user typed, a payment
//! notice, a group metadata update, and so on. Payloads are serialized to
//! JSON and carried opaquely inside transport envelopes; the transport treats
//! them as bytes and handles the encryption itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::types::{Address, GroupId};

/// Everything a message body can be.
///
/// Wire-borne kinds travel between devices; `Timestamp` and `Status` are
/// synthesized locally by the conversation store and never leave the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Payload {
    /// Plain text chat message
    Text { body: String },

    /// Request that the peer sends a token payment
    PaymentRequest {
        value: String,
        to_address: String,
        body: Option<String>,
    },

    /// Notice that a token payment was submitted
    Payment { value: String, tx_hash: String },

    /// First-contact handshake carrying profile basics
    Init {
        payment_address: String,
        language: String,
    },

    /// Aggregate group metadata broadcast (membership, title, avatar)
    GroupInfo {
        title: String,
        avatar: Option<String>,
        member_ids: Vec<Address>,
    },

    /// Sender is leaving the group this envelope is addressed to
    GroupLeave,

    /// Synthetic time separator shown between messages far apart in time
    Timestamp,

    /// Synthetic group lifecycle notice ("X joined", "renamed to Y", ...)
    Status(StatusPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StatusPayload {
    GroupCreated,
    AddedToGroup { title: String },
    MembersAdded { added: Vec<Address> },
    MemberLeft { member: Address },
    NameChanged { title: String },
}

impl Payload {
    /// Whether this payload renders as a message bubble/row in a conversation.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Payload::Text { .. }
                | Payload::PaymentRequest { .. }
                | Payload::Payment { .. }
                | Payload::Timestamp
                | Payload::Status(_)
        )
    }

    /// Whether this payload is a locally synthesized status row. Status
    /// payloads are never counted toward unread and never sent to peers.
    pub fn is_local_status(&self) -> bool {
        matches!(self, Payload::Timestamp | Payload::Status(_))
    }

    /// Serialize to the JSON bytes carried inside an envelope.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from envelope bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload handed to the transport for delivery. The transport encrypts
/// `content` and attaches its own addressing; `group` tells the receiving
/// side which group thread the message belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEnvelope {
    pub group: Option<GroupId>,
    pub content: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

/// Decrypted envelope surfaced by the transport's message stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    pub sender: Address,
    pub group: Option<GroupId>,
    pub content: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer over IPC, and so `Recipient` snapshots can be
//! stored as a JSON column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use satchel_shared::payload::{Payload, StatusPayload};
use satchel_shared::{Address, GroupId, ThreadId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A peer the local user can exchange messages with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// The peer's stable address (Ed25519 public key).
    pub address: Address,
    /// Optional handle chosen by the peer.
    pub username: Option<String>,
    /// Optional wallet address payments to this peer should go to.
    pub payment_address: Option<String>,
    /// Optional avatar reference (URL or content hash).
    pub avatar: Option<String>,
}

impl User {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            username: None,
            payment_address: None,
            avatar: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A multi-member group. The id doubles as the conversation's thread id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    /// Remote-allocated group identity.
    pub id: GroupId,
    /// Display title.
    pub title: String,
    /// Optional avatar reference (URL or content hash).
    pub avatar: Option<String>,
    /// Current members, unique, in display order.
    pub member_ids: Vec<Address>,
}

impl Group {
    pub fn new(id: GroupId, title: impl Into<String>, members: Vec<Address>) -> Self {
        let mut group = Self {
            id,
            title: title.into(),
            avatar: None,
            member_ids: Vec::new(),
        };
        group.add_members(&members);
        group
    }

    pub fn thread_id(&self) -> ThreadId {
        self.id.thread_id()
    }

    /// Append members that are not yet present; returns the ones actually
    /// added, preserving the order they were given in.
    pub fn add_members(&mut self, members: &[Address]) -> Vec<Address> {
        let mut added = Vec::new();
        for member in members {
            if !self.member_ids.contains(member) {
                self.member_ids.push(member.clone());
                added.push(member.clone());
            }
        }
        added
    }

    /// Remove a member; returns whether it was present.
    pub fn remove_member(&mut self, member: &Address) -> bool {
        let before = self.member_ids.len();
        self.member_ids.retain(|m| m != member);
        self.member_ids.len() != before
    }
}

// ---------------------------------------------------------------------------
// Recipient
// ---------------------------------------------------------------------------

/// Who a conversation is with: a single peer or a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Recipient {
    User(User),
    Group(Group),
}

impl Recipient {
    /// The thread id this recipient addresses.
    pub fn thread_id(&self) -> ThreadId {
        match self {
            Recipient::User(user) => user.address.thread_id(),
            Recipient::Group(group) => group.thread_id(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Recipient::Group(_))
    }

    pub fn group(&self) -> Option<&Group> {
        match self {
            Recipient::Group(group) => Some(group),
            Recipient::User(_) => None,
        }
    }

    pub fn group_mut(&mut self) -> Option<&mut Group> {
        match self {
            Recipient::Group(group) => Some(group),
            Recipient::User(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// Delivery state of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SendState {
    /// Persisted locally, delivery not confirmed yet.
    Sending = 0,
    /// Delivered to the backend.
    Sent = 1,
    /// Delivery failed; the user can resend.
    Failed = 2,
    /// Received from a remote peer.
    Received = 3,
}

impl SendState {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Sending),
            1 => Some(Self::Sent),
            2 => Some(Self::Failed),
            3 => Some(Self::Received),
            _ => None,
        }
    }
}

/// A single chat message. The body is an application payload; its kind
/// decides visibility and unread accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Unique message identifier, generated locally, immutable.
    pub id: Uuid,
    /// Address of whoever authored the message.
    pub sender: Address,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
    /// Delivery state.
    pub send_state: SendState,
    /// Message body.
    pub payload: Payload,
}

impl ChatMessage {
    /// A fresh outbound message in the `Sending` state.
    pub fn new(sender: Address, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            created_at: Utc::now(),
            send_state: SendState::Sending,
            payload,
        }
    }

    /// A message received from a remote peer.
    pub fn received(sender: Address, payload: Payload) -> Self {
        Self::new(sender, payload).with_state(SendState::Received)
    }

    /// A locally synthesized group status row.
    pub fn local_status(sender: Address, status: StatusPayload) -> Self {
        Self::new(sender, Payload::Status(status)).with_state(SendState::Sent)
    }

    /// A locally synthesized time separator row.
    pub fn timestamp_separator(sender: Address) -> Self {
        Self::new(sender, Payload::Timestamp).with_state(SendState::Sent)
    }

    pub fn with_state(mut self, state: SendState) -> Self {
        self.send_state = state;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_user_visible(&self) -> bool {
        self.payload.is_user_visible()
    }

    pub fn is_local_status(&self) -> bool {
        self.payload.is_local_status()
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// User-controlled flags on a conversation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationStatus {
    /// Whether the local user has accepted this conversation. Unaccepted
    /// conversations are the "message requests" list.
    pub is_accepted: bool,
    /// Whether notifications for this conversation are muted.
    pub is_muted: bool,
}

/// A conversation with one recipient. The full ordered message sequence
/// lives in the `messages` table; only the latest message is embedded here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    /// Stable identity, derived from the recipient. Immutable.
    pub thread_id: ThreadId,
    /// Who the conversation is with.
    pub recipient: Recipient,
    /// Timestamp of the latest mutation, non-decreasing in normal operation.
    pub updated_at: DateTime<Utc>,
    /// Messages received while the thread was not watched.
    pub unread_count: u32,
    /// Accepted/muted flags.
    pub status: ConversationStatus,
    /// The current tail of the message sequence, if any.
    pub latest_message: Option<ChatMessage>,
}

impl Conversation {
    /// A brand-new conversation with no messages yet.
    pub fn new(recipient: Recipient) -> Self {
        Self {
            thread_id: recipient.thread_id(),
            recipient,
            updated_at: Utc::now(),
            unread_count: 0,
            status: ConversationStatus::default(),
            latest_message: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.recipient.is_group()
    }
}

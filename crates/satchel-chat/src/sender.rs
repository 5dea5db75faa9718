//! Outbound message dispatch with a single-worker task queue.
//!
//! Every outbound operation becomes a [`MessageTask`] queued into one
//! worker, so storage writes and deliveries happen strictly in submission
//! order. Group lifecycle operations (create, update, leave) run directly
//! against store and transport; the metadata update is split into
//! best-effort substeps so one failing field cannot block the others.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use satchel_shared::payload::{OutboundEnvelope, Payload};
use satchel_shared::{Address, GroupId};
use satchel_store::{ChatMessage, Conversation, ConversationStore, Group, Recipient, SendState};

use crate::error::{ChatError, Result};
use crate::transport::{Transport, TransportError};

// ---------------------------------------------------------------------------
// Task types
// ---------------------------------------------------------------------------

/// One unit of outbound work.
#[derive(Debug)]
pub enum MessageTask {
    /// Persist locally, then deliver. Delivery failure keeps the local copy
    /// in a failed state so the user can resend it.
    SendAndSave {
        recipient: Recipient,
        message: ChatMessage,
    },
    /// Deliver without persisting (protocol control traffic such as the
    /// first-contact handshake).
    SendOnly {
        recipient: Recipient,
        message: ChatMessage,
    },
    /// Persist only, left in the sending state. Used to record a payment
    /// locally before the network confirms it.
    SaveOnly {
        recipient: Recipient,
        message: ChatMessage,
    },
    /// Overwrite an already-persisted message by id.
    Update {
        recipient: Recipient,
        message: ChatMessage,
    },
    /// Re-deliver an already-persisted message without re-inserting it.
    Resend {
        recipient: Recipient,
        message: ChatMessage,
    },
}

enum SenderCommand {
    Task(MessageTask),
    Shutdown,
}

/// Requested changes for [`MessageSender::update_group`]. Unset fields are
/// skipped.
#[derive(Debug, Clone)]
pub struct GroupUpdate {
    pub group_id: GroupId,
    pub add_members: Vec<Address>,
    pub title: Option<String>,
    pub avatar: Option<String>,
}

impl GroupUpdate {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            add_members: Vec::new(),
            title: None,
            avatar: None,
        }
    }

    pub fn add_members(mut self, members: Vec<Address>) -> Self {
        self.add_members = members;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Result of one substep of a group update.
#[derive(Debug, Clone, PartialEq)]
pub enum SubstepOutcome {
    /// The substep ran against the store.
    Applied,
    /// Nothing was requested for this substep.
    Skipped,
    /// The substep failed; the rest of the update proceeded anyway.
    Failed(String),
}

/// Aggregated result of [`MessageSender::update_group`]: one tag per
/// substep plus the final group-info broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupUpdateOutcome {
    pub members: SubstepOutcome,
    pub title: SubstepOutcome,
    pub avatar: SubstepOutcome,
    pub broadcast: SubstepOutcome,
}

impl GroupUpdateOutcome {
    pub fn fully_applied(&self) -> bool {
        ![&self.members, &self.title, &self.avatar, &self.broadcast]
            .iter()
            .any(|outcome| matches!(outcome, SubstepOutcome::Failed(_)))
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

pub struct MessageSender<T: Transport> {
    address: Address,
    store: Arc<ConversationStore>,
    transport: Arc<T>,
    commands: mpsc::UnboundedSender<SenderCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> MessageSender<T> {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn new(address: Address, store: Arc<ConversationStore>, transport: Arc<T>) -> Self {
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let worker_store = Arc::clone(&store);
        let worker_transport = Arc::clone(&transport);

        let worker = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    SenderCommand::Task(task) => {
                        if let Err(e) =
                            process_task(&worker_store, worker_transport.as_ref(), task).await
                        {
                            warn!(error = %e, "outbound task failed");
                        }
                    }
                    SenderCommand::Shutdown => break,
                }
            }
            debug!("message sender worker stopped");
        });

        Self {
            address,
            store,
            transport,
            commands,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an outbound task. Tasks are processed strictly in submission
    /// order by the single worker.
    pub fn queue(&self, task: MessageTask) -> Result<()> {
        self.commands
            .send(SenderCommand::Task(task))
            .map_err(|_| ChatError::Task("sender worker is gone".to_string()))
    }

    /// Build a message from `payload` and queue it for persist-then-deliver.
    /// Returns the queued copy so the caller can track its id.
    pub fn send_message(&self, recipient: &Recipient, payload: Payload) -> Result<ChatMessage> {
        let message = ChatMessage::new(self.address.clone(), payload);
        self.queue(MessageTask::SendAndSave {
            recipient: recipient.clone(),
            message: message.clone(),
        })?;
        Ok(message)
    }

    /// Deliver a control payload without persisting it.
    pub fn send_control(&self, recipient: &Recipient, payload: Payload) -> Result<()> {
        let message = ChatMessage::new(self.address.clone(), payload);
        self.queue(MessageTask::SendOnly {
            recipient: recipient.clone(),
            message,
        })
    }

    /// Record `payload` locally in the sending state without delivering.
    pub fn save_transaction(&self, recipient: &Recipient, payload: Payload) -> Result<ChatMessage> {
        let message = ChatMessage::new(self.address.clone(), payload);
        self.queue(MessageTask::SaveOnly {
            recipient: recipient.clone(),
            message: message.clone(),
        })?;
        Ok(message)
    }

    /// Queue an overwrite of an already-persisted message.
    pub fn update_message(&self, recipient: &Recipient, message: ChatMessage) -> Result<()> {
        self.queue(MessageTask::Update {
            recipient: recipient.clone(),
            message,
        })
    }

    /// Re-attempt delivery of an already-persisted message.
    pub fn resend_message(&self, recipient: &Recipient, message: ChatMessage) -> Result<()> {
        self.queue(MessageTask::Resend {
            recipient: recipient.clone(),
            message,
        })
    }

    // -----------------------------------------------------------------
    // Group lifecycle
    // -----------------------------------------------------------------

    /// Allocate a group on the backend, create the local conversation and
    /// tell the members.
    pub async fn create_group(&self, title: &str, members: Vec<Address>) -> Result<Conversation> {
        let group_id = self.transport.allocate_group().await?;

        let mut all_members = members;
        if !all_members.contains(&self.address) {
            all_members.insert(0, self.address.clone());
        }
        let group = Group::new(group_id, title, all_members);

        let conversation = self
            .store
            .create_group_conversation(&self.address, &group)
            .await?;

        // Members that miss this learn about the group from the next
        // metadata update.
        if let Err(e) = self.send_group_info(&group).await {
            warn!(group_id = %group.id, error = %e, "initial group broadcast failed");
        }
        Ok(conversation)
    }

    /// Apply a metadata update as independent best-effort substeps, then
    /// broadcast the aggregate group snapshot to all members regardless of
    /// how many substeps failed.
    pub async fn update_group(&self, update: GroupUpdate) -> GroupUpdateOutcome {
        let GroupUpdate {
            group_id,
            add_members,
            title,
            avatar,
        } = update;

        let members = if add_members.is_empty() {
            SubstepOutcome::Skipped
        } else {
            match self
                .store
                .add_group_members(&self.address, &group_id, &add_members)
                .await
            {
                Ok(_) => SubstepOutcome::Applied,
                Err(e) => {
                    warn!(group_id = %group_id, error = %e, "adding group members failed");
                    SubstepOutcome::Failed(e.to_string())
                }
            }
        };

        let title = match title {
            None => SubstepOutcome::Skipped,
            Some(title) => match self
                .store
                .rename_group(&self.address, &group_id, &title)
                .await
            {
                Ok(_) => SubstepOutcome::Applied,
                Err(e) => {
                    warn!(group_id = %group_id, error = %e, "renaming group failed");
                    SubstepOutcome::Failed(e.to_string())
                }
            },
        };

        let avatar = match avatar {
            None => SubstepOutcome::Skipped,
            Some(avatar) => match self.store.save_group_avatar(&group_id, &avatar).await {
                Ok(_) => SubstepOutcome::Applied,
                Err(e) => {
                    warn!(group_id = %group_id, error = %e, "saving group avatar failed");
                    SubstepOutcome::Failed(e.to_string())
                }
            },
        };

        let broadcast = match self.send_group_update(&group_id).await {
            Ok(()) => SubstepOutcome::Applied,
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "group info broadcast failed");
                SubstepOutcome::Failed(e.to_string())
            }
        };

        GroupUpdateOutcome {
            members,
            title,
            avatar,
            broadcast,
        }
    }

    /// Broadcast the stored group snapshot to every member.
    pub async fn send_group_update(&self, group_id: &GroupId) -> Result<()> {
        let conversation = self
            .store
            .load_conversation(&group_id.thread_id())
            .await?
            .ok_or_else(|| ChatError::InvalidRequest(format!("unknown group {group_id}")))?;
        let group = conversation.recipient.group().cloned().ok_or_else(|| {
            ChatError::InvalidRequest(format!("thread {} is not a group", conversation.thread_id))
        })?;
        self.send_group_info(&group).await
    }

    /// Notify the group that this device's user is leaving. Local teardown
    /// (conversation delete, notification cleanup) belongs to the session.
    pub async fn leave_group(&self, group: &Group) -> Result<()> {
        let message = ChatMessage::new(self.address.clone(), Payload::GroupLeave);
        let envelope = envelope_for(&message, Some(group.id.clone()))?;
        self.transport
            .send_to_group(&group.member_ids, envelope)
            .await?;
        Ok(())
    }

    /// Stop the worker once the already-queued tasks drain. Idempotent.
    pub async fn clear(&self) {
        let _ = self.commands.send(SenderCommand::Shutdown);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn send_group_info(&self, group: &Group) -> Result<()> {
        let message = ChatMessage::new(
            self.address.clone(),
            Payload::GroupInfo {
                title: group.title.clone(),
                avatar: group.avatar.clone(),
                member_ids: group.member_ids.clone(),
            },
        );
        let envelope = envelope_for(&message, Some(group.id.clone()))?;
        self.transport
            .send_to_group(&group.member_ids, envelope)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker internals
// ---------------------------------------------------------------------------

async fn process_task<T: Transport>(
    store: &ConversationStore,
    transport: &T,
    task: MessageTask,
) -> Result<()> {
    match task {
        MessageTask::SendAndSave { recipient, message } => {
            store.save_message(&recipient, message.clone()).await?;
            deliver_and_mark(store, transport, &recipient, message).await
        }
        MessageTask::SendOnly { recipient, message } => {
            let envelope = envelope_for(&message, recipient.group().map(|g| g.id.clone()))?;
            deliver(transport, &recipient, envelope).await?;
            Ok(())
        }
        MessageTask::SaveOnly { recipient, message } => {
            store.save_message(&recipient, message).await?;
            Ok(())
        }
        MessageTask::Update { recipient, message } => {
            store.update_message(&recipient, message).await?;
            Ok(())
        }
        MessageTask::Resend { recipient, message } => {
            deliver_and_mark(store, transport, &recipient, message).await
        }
    }
}

/// Deliver an already-persisted message and record the outcome on its row.
/// Delivery failure is not an error here: the local copy stays, marked
/// failed, ready for a resend.
async fn deliver_and_mark<T: Transport>(
    store: &ConversationStore,
    transport: &T,
    recipient: &Recipient,
    message: ChatMessage,
) -> Result<()> {
    let envelope = envelope_for(&message, recipient.group().map(|g| g.id.clone()))?;
    match deliver(transport, recipient, envelope).await {
        Ok(()) => {
            store
                .update_message(recipient, message.with_state(SendState::Sent))
                .await?;
        }
        Err(e) => {
            warn!(message_id = %message.id, error = %e, "delivery failed, message kept for resend");
            store
                .update_message(recipient, message.with_state(SendState::Failed))
                .await?;
        }
    }
    Ok(())
}

async fn deliver<T: Transport>(
    transport: &T,
    recipient: &Recipient,
    envelope: OutboundEnvelope,
) -> std::result::Result<(), TransportError> {
    match recipient {
        Recipient::User(user) => transport.send(&user.address, envelope).await,
        Recipient::Group(group) => transport.send_to_group(&group.member_ids, envelope).await,
    }
}

fn envelope_for(message: &ChatMessage, group: Option<GroupId>) -> Result<OutboundEnvelope> {
    Ok(OutboundEnvelope {
        group,
        content: message.payload.encode()?,
        sent_at: message.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryNetwork, InMemoryTransport};
    use satchel_shared::constants::MAX_AVATAR_BYTES;
    use satchel_shared::payload::StatusPayload;
    use satchel_store::{Database, User};
    use std::sync::Mutex as StdMutex;

    fn addr(byte: u8) -> Address {
        Address([byte; 32])
    }

    fn peer(byte: u8) -> Recipient {
        Recipient::User(User::new(addr(byte)))
    }

    fn text(body: &str) -> Payload {
        Payload::Text {
            body: body.to_string(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        network: Arc<InMemoryNetwork>,
        transport: Arc<InMemoryTransport>,
        store: Arc<ConversationStore>,
        sender: MessageSender<InMemoryTransport>,
    }

    fn fixture(local: u8) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap();
        let store = Arc::new(ConversationStore::new(Arc::new(StdMutex::new(db))));
        let network = InMemoryNetwork::new();
        let transport = network.transport(addr(local));
        let sender = MessageSender::new(addr(local), store.clone(), transport.clone());
        Fixture {
            _dir: dir,
            network,
            transport,
            store,
            sender,
        }
    }

    #[tokio::test]
    async fn send_and_save_delivers_and_marks_sent() {
        let f = fixture(1);
        let bob = f.network.transport(addr(2));
        let recipient = peer(2);

        let mut events = f.store.register_for_changes(&recipient.thread_id());
        let queued = f.sender.send_message(&recipient, text("hello bob")).unwrap();

        let saved = events.new_messages.recv().await.unwrap();
        assert_eq!(saved.id, queued.id);
        assert_eq!(saved.send_state, SendState::Sending);

        let updated = events.updated_messages.recv().await.unwrap();
        assert_eq!(updated.send_state, SendState::Sent);

        let inbound = bob.next_envelope().await.unwrap();
        assert_eq!(inbound.sender, addr(1));
        assert_eq!(Payload::decode(&inbound.content).unwrap(), text("hello bob"));
    }

    #[tokio::test]
    async fn failed_delivery_keeps_resendable_copy() {
        let f = fixture(1);
        let bob = f.network.transport(addr(2));
        let recipient = peer(2);
        f.transport.set_fail_sends(true);

        let mut events = f.store.register_for_changes(&recipient.thread_id());
        let queued = f.sender.send_message(&recipient, text("flaky")).unwrap();

        let updated = events.updated_messages.recv().await.unwrap();
        assert_eq!(updated.send_state, SendState::Failed);

        let stored = f.store.message_by_id(queued.id).await.unwrap();
        assert_eq!(stored.send_state, SendState::Failed);

        // Network recovers: the user resends the same message.
        f.transport.set_fail_sends(false);
        f.sender.resend_message(&recipient, stored).unwrap();

        let updated = events.updated_messages.recv().await.unwrap();
        assert_eq!(updated.send_state, SendState::Sent);
        assert_eq!(
            Payload::decode(&bob.next_envelope().await.unwrap().content).unwrap(),
            text("flaky")
        );
        // Still exactly one copy locally.
        assert_eq!(f.store.messages(&recipient.thread_id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_only_persists_nothing() {
        let f = fixture(1);
        let bob = f.network.transport(addr(2));
        let recipient = peer(2);

        f.sender
            .send_control(
                &recipient,
                Payload::Init {
                    payment_address: "0xabc".to_string(),
                    language: "en".to_string(),
                },
            )
            .unwrap();

        let inbound = bob.next_envelope().await.unwrap();
        assert!(matches!(
            Payload::decode(&inbound.content).unwrap(),
            Payload::Init { .. }
        ));
        assert!(f
            .store
            .load_conversation(&recipient.thread_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn save_only_records_without_delivering() {
        let f = fixture(1);
        let recipient = peer(2);

        let mut changes = f.store.subscribe_conversation_changes();
        let queued = f
            .sender
            .save_transaction(
                &recipient,
                Payload::Payment {
                    value: "0x16345785d8a0000".to_string(),
                    tx_hash: "0xfeed".to_string(),
                },
            )
            .unwrap();

        changes.recv().await.unwrap();
        let stored = f.store.message_by_id(queued.id).await.unwrap();
        assert_eq!(stored.send_state, SendState::Sending);
        assert!(f.transport.sent_envelopes().is_empty());
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let f = fixture(1);
        let _bob = f.network.transport(addr(2));
        let recipient = peer(2);

        let mut changes = f.store.subscribe_conversation_changes();
        for body in ["first", "second", "third"] {
            f.sender.send_message(&recipient, text(body)).unwrap();
        }
        for _ in 0..3 {
            changes.recv().await.unwrap();
        }

        let bodies: Vec<Payload> = f
            .store
            .messages(&recipient.thread_id())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(bodies, vec![text("first"), text("second"), text("third")]);
    }

    #[tokio::test]
    async fn create_group_allocates_and_broadcasts() {
        let f = fixture(1);
        let bob = f.network.transport(addr(2));

        let conversation = f
            .sender
            .create_group("book club", vec![addr(2)])
            .await
            .unwrap();
        assert!(conversation.status.is_accepted);
        assert!(conversation.is_group());

        let inbound = bob.next_envelope().await.unwrap();
        assert!(inbound.group.is_some());
        match Payload::decode(&inbound.content).unwrap() {
            Payload::GroupInfo {
                title, member_ids, ..
            } => {
                assert_eq!(title, "book club");
                assert!(member_ids.contains(&addr(1)));
                assert!(member_ids.contains(&addr(2)));
            }
            other => panic!("expected group info, got {other:?}"),
        }

        // The local thread opens with a "group created" status row.
        let messages = f.store.messages(&conversation.thread_id).await.unwrap();
        assert_eq!(
            messages[0].payload,
            Payload::Status(StatusPayload::GroupCreated)
        );
    }

    #[tokio::test]
    async fn group_update_substeps_fail_independently() {
        let f = fixture(1);
        let bob = f.network.transport(addr(2));
        let conversation = f
            .sender
            .create_group("trip", vec![addr(2)])
            .await
            .unwrap();
        let group_id = conversation.recipient.group().unwrap().id.clone();
        // Drain the creation broadcast.
        bob.next_envelope().await.unwrap();

        let oversized_avatar = "x".repeat(MAX_AVATAR_BYTES + 1);
        let outcome = f
            .sender
            .update_group(
                GroupUpdate::new(group_id.clone())
                    .add_members(vec![addr(3)])
                    .title("road trip")
                    .avatar(oversized_avatar),
            )
            .await;

        assert_eq!(outcome.members, SubstepOutcome::Applied);
        assert_eq!(outcome.title, SubstepOutcome::Applied);
        assert!(matches!(outcome.avatar, SubstepOutcome::Failed(_)));
        assert_eq!(outcome.broadcast, SubstepOutcome::Applied);
        assert!(!outcome.fully_applied());

        // Members and title converged, the avatar did not.
        let stored = f
            .store
            .load_conversation(&group_id.thread_id())
            .await
            .unwrap()
            .unwrap();
        let group = stored.recipient.group().unwrap();
        assert_eq!(group.title, "road trip");
        assert!(group.member_ids.contains(&addr(3)));
        assert!(group.avatar.is_none());

        // The aggregate broadcast still went out with the updated snapshot.
        let inbound = bob.next_envelope().await.unwrap();
        match Payload::decode(&inbound.content).unwrap() {
            Payload::GroupInfo {
                title,
                avatar,
                member_ids,
            } => {
                assert_eq!(title, "road trip");
                assert_eq!(avatar, None);
                assert!(member_ids.contains(&addr(3)));
            }
            other => panic!("expected group info, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_group_notifies_members() {
        let f = fixture(1);
        let bob = f.network.transport(addr(2));
        let conversation = f
            .sender
            .create_group("short lived", vec![addr(2)])
            .await
            .unwrap();
        bob.next_envelope().await.unwrap();

        let group = conversation.recipient.group().unwrap().clone();
        f.sender.leave_group(&group).await.unwrap();

        let inbound = bob.next_envelope().await.unwrap();
        assert_eq!(Payload::decode(&inbound.content).unwrap(), Payload::GroupLeave);
    }

    #[tokio::test]
    async fn clear_stops_the_worker() {
        let f = fixture(1);
        f.sender.clear().await;
        f.sender.clear().await;

        assert!(f
            .sender
            .send_message(&peer(2), text("too late"))
            .is_err());
    }
}

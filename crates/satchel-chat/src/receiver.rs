//! Inbound envelope pump.
//!
//! One worker pulls envelopes off the transport, routes group control
//! traffic into the store's group reconciliation and persists chat traffic
//! as received messages. Arrivals are republished on a broadcast channel
//! so push-triggered wakeups can await the next message instead of polling
//! the store.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use satchel_shared::payload::{InboundEnvelope, Payload};
use satchel_shared::Address;
use satchel_store::{ChatMessage, Conversation, ConversationStore, Group, Recipient, User};

use crate::error::{ChatError, Result};
use crate::transport::Transport;

const INCOMING_CHANNEL_CAPACITY: usize = 256;

/// A message that just landed in the store, paired with the refreshed
/// conversation it belongs to.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub conversation: Conversation,
    pub message: ChatMessage,
}

pub struct MessageReceiver<T: Transport> {
    store: Arc<ConversationStore>,
    transport: Arc<T>,
    incoming: broadcast::Sender<IncomingMessage>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> MessageReceiver<T> {
    /// Build an idle receiver. Nothing is pulled until [`start`] runs,
    /// which lets the session hold off until registration succeeded.
    ///
    /// [`start`]: MessageReceiver::start
    pub fn new(store: Arc<ConversationStore>, transport: Arc<T>) -> Self {
        let (incoming, _) = broadcast::channel(INCOMING_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            transport,
            incoming,
            shutdown,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the pump if it is not already running. Safe to call on every
    /// connectivity restore.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("message receiver already running");
            return;
        }
        self.shutdown.send_replace(false);
        *worker = Some(tokio::spawn(run_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.incoming.clone(),
            self.shutdown.subscribe(),
        )));
    }

    /// Live feed of arrivals. Slow subscribers miss messages rather than
    /// backpressuring the pump.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming.subscribe()
    }

    /// Wait for the next message to land in the store. Push wakeups use
    /// this to grab the message that triggered the notification.
    pub async fn fetch_latest_message(&self) -> Result<IncomingMessage> {
        let mut arrivals = self.incoming.subscribe();
        loop {
            match arrivals.recv().await {
                Ok(incoming) => return Ok(incoming),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ChatError::Task("message receiver is gone".to_string()))
                }
            }
        }
    }

    /// Stop the pump and wait for it to exit. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_loop<T: Transport>(
    store: Arc<ConversationStore>,
    transport: Arc<T>,
    incoming: broadcast::Sender<IncomingMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("message receiver started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            maybe = transport.next_envelope() => match maybe {
                Some(envelope) => {
                    if let Err(e) = route_envelope(&store, &incoming, envelope).await {
                        warn!(error = %e, "dropping inbound envelope");
                    }
                }
                None => {
                    info!("inbound stream closed");
                    break;
                }
            },
        }
    }
    debug!("message receiver stopped");
}

/// Decode and dispatch one envelope. Group info and leave notices mutate
/// group state without producing a visible message. Init handshakes and
/// locally synthesized kinds never reach the store; chat payloads are
/// persisted under the sender's thread.
async fn route_envelope(
    store: &ConversationStore,
    incoming: &broadcast::Sender<IncomingMessage>,
    envelope: InboundEnvelope,
) -> Result<()> {
    let payload = Payload::decode(&envelope.content)?;
    let InboundEnvelope {
        sender,
        group,
        sent_at,
        ..
    } = envelope;

    match payload {
        Payload::GroupInfo {
            title,
            avatar,
            member_ids,
        } => match group {
            Some(group_id) => {
                let mut snapshot = Group::new(group_id, title, member_ids);
                snapshot.avatar = avatar;
                store.apply_group_snapshot(&sender, &snapshot).await?;
                Ok(())
            }
            None => {
                warn!(sender = %sender, "group info without a group id");
                Ok(())
            }
        },
        Payload::GroupLeave => match group {
            Some(group_id) => {
                store.remove_group_member(&group_id, &sender).await?;
                Ok(())
            }
            None => {
                warn!(sender = %sender, "group leave without a group id");
                Ok(())
            }
        },
        Payload::Init { .. } => {
            // The handshake only introduces the peer. There is nothing to
            // show until they actually say something.
            debug!(sender = %sender, "received init handshake");
            Ok(())
        }
        Payload::Timestamp | Payload::Status(_) => {
            warn!(sender = %sender, "dropping local-only payload from the wire");
            Ok(())
        }
        payload => {
            let recipient = match group {
                Some(group_id) => match store.load_conversation(&group_id.thread_id()).await? {
                    Some(conversation) => conversation.recipient,
                    // Chatter for a group this device has not heard of yet.
                    // A skeleton thread keeps the message; the next group
                    // info broadcast fills in the metadata.
                    None => Recipient::Group(Group::new(group_id, "", vec![sender.clone()])),
                },
                None => Recipient::User(User::new(sender.clone())),
            };
            save_incoming(store, incoming, recipient, sender, payload, sent_at).await
        }
    }
}

async fn save_incoming(
    store: &ConversationStore,
    incoming: &broadcast::Sender<IncomingMessage>,
    recipient: Recipient,
    sender: Address,
    payload: Payload,
    sent_at: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let message = ChatMessage::received(sender, payload).with_created_at(sent_at);
    let conversation = store.save_message(&recipient, message.clone()).await?;
    let _ = incoming.send(IncomingMessage {
        conversation,
        message,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryNetwork, InMemoryTransport};
    use chrono::Utc;
    use satchel_shared::payload::{OutboundEnvelope, StatusPayload};
    use satchel_shared::GroupId;
    use satchel_store::{Database, SendState};
    use std::sync::Mutex as StdMutex;

    fn addr(byte: u8) -> Address {
        Address([byte; 32])
    }

    fn text(body: &str) -> Payload {
        Payload::Text {
            body: body.to_string(),
        }
    }

    fn envelope(payload: &Payload, group: Option<GroupId>) -> OutboundEnvelope {
        OutboundEnvelope {
            group,
            content: payload.encode().unwrap(),
            sent_at: Utc::now(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        network: Arc<InMemoryNetwork>,
        store: Arc<ConversationStore>,
        receiver: MessageReceiver<InMemoryTransport>,
    }

    fn fixture(local: u8) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap();
        let store = Arc::new(ConversationStore::new(Arc::new(StdMutex::new(db))));
        let network = InMemoryNetwork::new();
        let transport = network.transport(addr(local));
        let receiver = MessageReceiver::new(store.clone(), transport);
        Fixture {
            _dir: dir,
            network,
            store,
            receiver,
        }
    }

    #[tokio::test]
    async fn inbound_text_lands_in_store_and_stream() {
        let f = fixture(1);
        f.receiver.start();
        let mut arrivals = f.receiver.subscribe_incoming();

        let bob = f.network.transport(addr(2));
        bob.send(&addr(1), envelope(&text("hi alice"), None))
            .await
            .unwrap();

        let incoming = arrivals.recv().await.unwrap();
        assert_eq!(incoming.message.sender, addr(2));
        assert_eq!(incoming.message.send_state, SendState::Received);
        assert_eq!(incoming.message.payload, text("hi alice"));

        // A thread auto-created by an inbound message waits for the user
        // to accept it, with the arrival counted as unread.
        assert!(!incoming.conversation.status.is_accepted);
        assert_eq!(incoming.conversation.unread_count, 1);

        let stored = f
            .store
            .messages(&incoming.conversation.thread_id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, incoming.message.id);
    }

    #[tokio::test]
    async fn unknown_group_chatter_creates_skeleton_thread() {
        let f = fixture(1);
        f.receiver.start();
        let mut arrivals = f.receiver.subscribe_incoming();

        let bob = f.network.transport(addr(2));
        let group_id = GroupId::random();
        bob.send(&addr(1), envelope(&text("anyone here?"), Some(group_id.clone())))
            .await
            .unwrap();

        let incoming = arrivals.recv().await.unwrap();
        let group = incoming.conversation.recipient.group().unwrap();
        assert_eq!(group.id, group_id);
        assert_eq!(group.title, "");
        assert_eq!(group.member_ids, vec![addr(2)]);
        assert!(!incoming.conversation.status.is_accepted);
    }

    #[tokio::test]
    async fn group_info_applies_snapshot_without_visible_message() {
        let f = fixture(1);
        f.receiver.start();
        let mut changes = f.store.subscribe_conversation_changes();

        let bob = f.network.transport(addr(2));
        let group_id = GroupId::random();
        let info = Payload::GroupInfo {
            title: "climbing".to_string(),
            avatar: None,
            member_ids: vec![addr(1), addr(2)],
        };
        bob.send(&addr(1), envelope(&info, Some(group_id.clone())))
            .await
            .unwrap();

        let conversation = changes.recv().await.unwrap();
        assert!(conversation.status.is_accepted);
        let group = conversation.recipient.group().unwrap();
        assert_eq!(group.title, "climbing");
        assert_eq!(group.member_ids.len(), 2);

        // Being added to a group shows up as a status row, not a chat
        // message from the inviter.
        let messages = f.store.messages(&conversation.thread_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].payload,
            Payload::Status(StatusPayload::AddedToGroup {
                title: "climbing".to_string()
            })
        );
    }

    #[tokio::test]
    async fn group_leave_removes_the_sender() {
        let f = fixture(1);
        f.receiver.start();
        let mut changes = f.store.subscribe_conversation_changes();

        let bob = f.network.transport(addr(2));
        let group_id = GroupId::random();
        let info = Payload::GroupInfo {
            title: "climbing".to_string(),
            avatar: None,
            member_ids: vec![addr(1), addr(2), addr(3)],
        };
        bob.send(&addr(1), envelope(&info, Some(group_id.clone())))
            .await
            .unwrap();
        changes.recv().await.unwrap();

        bob.send(&addr(1), envelope(&Payload::GroupLeave, Some(group_id.clone())))
            .await
            .unwrap();
        let conversation = changes.recv().await.unwrap();

        let group = conversation.recipient.group().unwrap();
        assert!(!group.member_ids.contains(&addr(2)));
        assert!(group.member_ids.contains(&addr(3)));
        let messages = f.store.messages(&conversation.thread_id).await.unwrap();
        assert!(messages.iter().any(|m| matches!(
            &m.payload,
            Payload::Status(StatusPayload::MemberLeft { member }) if *member == addr(2)
        )));
    }

    #[tokio::test]
    async fn handshake_and_local_kinds_are_not_persisted() {
        let f = fixture(1);
        f.receiver.start();
        let mut arrivals = f.receiver.subscribe_incoming();

        let bob = f.network.transport(addr(2));
        let init = Payload::Init {
            payment_address: "0xabc".to_string(),
            language: "en".to_string(),
        };
        bob.send(&addr(1), envelope(&init, None)).await.unwrap();
        bob.send(&addr(1), envelope(&Payload::Timestamp, None))
            .await
            .unwrap();
        bob.send(
            &addr(1),
            envelope(&Payload::Status(StatusPayload::GroupCreated), None),
        )
        .await
        .unwrap();
        bob.send(&addr(1), envelope(&text("real talk"), None))
            .await
            .unwrap();

        // The pump drains the mailbox in order, so the first arrival is
        // the text message only if the earlier three were dropped.
        let incoming = arrivals.recv().await.unwrap();
        assert_eq!(incoming.message.payload, text("real talk"));
        let stored = f
            .store
            .messages(&incoming.conversation.thread_id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_envelope_does_not_stop_the_pump() {
        let f = fixture(1);
        f.receiver.start();
        let mut arrivals = f.receiver.subscribe_incoming();

        let bob = f.network.transport(addr(2));
        bob.send(
            &addr(1),
            OutboundEnvelope {
                group: None,
                content: b"not a payload".to_vec(),
                sent_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        bob.send(&addr(1), envelope(&text("still alive"), None))
            .await
            .unwrap();

        let incoming = arrivals.recv().await.unwrap();
        assert_eq!(incoming.message.payload, text("still alive"));
    }

    #[tokio::test]
    async fn restart_after_shutdown_resumes_delivery() {
        let f = fixture(1);
        f.receiver.start();
        f.receiver.shutdown().await;
        f.receiver.shutdown().await;

        // Arrivals queue up in the mailbox while the pump is stopped.
        let bob = f.network.transport(addr(2));
        bob.send(&addr(1), envelope(&text("missed me?"), None))
            .await
            .unwrap();

        let mut arrivals = f.receiver.subscribe_incoming();
        f.receiver.start();
        let incoming = arrivals.recv().await.unwrap();
        assert_eq!(incoming.message.payload, text("missed me?"));
    }

    #[tokio::test]
    async fn fetch_latest_message_awaits_the_next_arrival() {
        let f = fixture(1);
        f.receiver.start();

        let receiver = Arc::new(f.receiver);
        let waiter = {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.fetch_latest_message().await })
        };
        // Give the waiter a chance to subscribe before the send.
        tokio::task::yield_now().await;

        let bob = f.network.transport(addr(2));
        bob.send(&addr(1), envelope(&text("wake up"), None))
            .await
            .unwrap();

        let incoming = waiter.await.unwrap().unwrap();
        assert_eq!(incoming.message.payload, text("wake up"));
    }
}

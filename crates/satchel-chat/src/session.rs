//! The chat session facade.
//!
//! [`ChatSession`] ties the pieces together: it opens the message store
//! with a key derived from the identity, registers the device, runs the
//! sender and receiver workers and re-drives registration when
//! connectivity comes back. Every operation reports
//! [`ChatError::Uninitialized`] until [`ChatSession::init`] has run, and
//! again after [`ChatSession::clear`].

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use satchel_shared::identity::Identity;
use satchel_shared::payload::Payload;
use satchel_shared::{Address, ThreadId};
use satchel_store::{
    ChatMessage, Conversation, ConversationEvents, ConversationStore, Database, Recipient,
    StoreError, User,
};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{ChatError, Result};
use crate::notifications::NotificationSink;
use crate::prefs::PreferenceStore;
use crate::receiver::{IncomingMessage, MessageReceiver};
use crate::registration::{device_credentials, Registrar, RegistrationState};
use crate::sender::{GroupUpdate, GroupUpdateOutcome, MessageSender, MessageTask};
use crate::transport::Transport;

enum SessionState<T: Transport> {
    /// No identity has been supplied yet.
    Uninitialized,
    /// `init` is running; operations fail until it finishes.
    Initializing,
    Ready(Arc<SessionHandles<T>>),
    /// Torn down by `clear`. A later `init` rebuilds from scratch.
    Cleared,
}

struct SessionHandles<T: Transport> {
    address: Address,
    store: Arc<ConversationStore>,
    sender: MessageSender<T>,
    receiver: Arc<MessageReceiver<T>>,
    registrar: Arc<Registrar<T>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

pub struct ChatSession<T: Transport> {
    config: SessionConfig,
    prefs: Arc<dyn PreferenceStore>,
    notifications: Arc<dyn NotificationSink>,
    state: RwLock<SessionState<T>>,
    init_lock: AsyncMutex<()>,
}

impl<T: Transport> ChatSession<T> {
    pub fn new(
        config: SessionConfig,
        prefs: Arc<dyn PreferenceStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            prefs,
            notifications,
            state: RwLock::new(SessionState::Uninitialized),
            init_lock: AsyncMutex::new(()),
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Bring the session up for `identity`: open the store, register the
    /// device and start the workers.
    ///
    /// Succeeds even while the backend is unreachable; registration is
    /// retried on the next connectivity restore and the inbound pump
    /// starts once it lands. Calling `init` on a ready session is a
    /// cheap no-op that re-checks registration.
    pub async fn init(&self, identity: &Identity, transport: Arc<T>) -> Result<()> {
        let _guard = self.init_lock.lock().await;

        if let Ok(handles) = self.handles() {
            debug!("chat session already initialized");
            match handles.registrar.ensure_registered().await {
                Ok(()) => handles.receiver.start(),
                Err(e) => warn!(error = %e, "registration check on repeated init failed"),
            }
            return Ok(());
        }

        self.set_state(SessionState::Initializing);
        match self.build_handles(identity, transport).await {
            Ok(handles) => {
                info!(address = %handles.address, "chat session ready");
                self.set_state(SessionState::Ready(handles));
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Uninitialized);
                Err(e)
            }
        }
    }

    /// Tear the session down: stop the workers and drop all handles.
    /// Local data stays on disk; a later [`init`] picks it up again.
    /// Safe to call repeatedly.
    ///
    /// [`init`]: ChatSession::init
    pub async fn clear(&self) {
        let _guard = self.init_lock.lock().await;
        let handles = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, SessionState::Cleared) {
                SessionState::Ready(handles) => Some(handles),
                _ => None,
            }
        };
        if let Some(handles) = handles {
            if let Some(watcher) = handles
                .watcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                // Join it so it cannot restart the receiver mid-teardown.
                watcher.abort();
                let _ = watcher.await;
            }
            handles.receiver.shutdown().await;
            handles.sender.clear().await;
            info!("chat session cleared");
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            &*self.state.read().unwrap_or_else(PoisonError::into_inner),
            SessionState::Ready(_)
        )
    }

    /// Address of the initialized identity.
    pub fn address(&self) -> Result<Address> {
        Ok(self.handles()?.address.clone())
    }

    pub fn registration_state(&self) -> Result<RegistrationState> {
        Ok(self.handles()?.registrar.state())
    }

    // -----------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------

    /// Persist an outbound message and queue it for delivery. Returns the
    /// queued copy so callers can track its id.
    pub fn send_message(&self, recipient: &Recipient, payload: Payload) -> Result<ChatMessage> {
        self.handles()?.sender.send_message(recipient, payload)
    }

    /// First-contact handshake: announces this device's payment address
    /// and configured language to a peer without leaving a trace in the
    /// thread.
    pub fn send_init_message(&self, to: &Address, payment_address: &str) -> Result<()> {
        let recipient = Recipient::User(User::new(to.clone()));
        self.handles()?.sender.send_control(
            &recipient,
            Payload::Init {
                payment_address: payment_address.to_string(),
                language: self.config.language.clone(),
            },
        )
    }

    /// Record a payment message locally without delivering it. The
    /// payment pipeline updates it once the network confirms.
    pub fn save_transaction(&self, recipient: &Recipient, payload: Payload) -> Result<ChatMessage> {
        self.handles()?.sender.save_transaction(recipient, payload)
    }

    /// Queue an overwrite of an already-persisted message.
    pub fn update_message(&self, recipient: &Recipient, message: ChatMessage) -> Result<()> {
        self.handles()?.sender.update_message(recipient, message)
    }

    /// Re-deliver a message that previously failed. The thread is looked
    /// up from the message id, so callers only need the message itself.
    pub async fn resend_message(&self, message: ChatMessage) -> Result<()> {
        let handles = self.handles()?;
        let thread_id = handles.store.thread_for_message(message.id).await?;
        let conversation = handles
            .store
            .load_conversation(&thread_id)
            .await?
            .ok_or(ChatError::Storage(StoreError::NotFound))?;
        handles
            .sender
            .resend_message(&conversation.recipient, message)
    }

    /// Queue a raw outbound task. The typed helpers above cover the
    /// common cases; this is the escape hatch for the rest.
    pub fn queue_task(&self, task: MessageTask) -> Result<()> {
        self.handles()?.sender.queue(task)
    }

    // -----------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------

    /// Create an accepted, empty conversation so a thread can be shown
    /// before the first message. Idempotent.
    pub async fn create_empty_conversation(&self, recipient: &Recipient) -> Result<Conversation> {
        Ok(self
            .handles()?
            .store
            .create_empty_conversation(recipient)
            .await?)
    }

    pub async fn load_conversation(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        Ok(self.handles()?.store.load_conversation(thread_id).await?)
    }

    /// Load a conversation for display, marking everything in it read.
    pub async fn load_conversation_and_reset_unread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .handles()?
            .store
            .load_conversation_and_reset_unread(thread_id)
            .await?)
    }

    pub async fn load_accepted_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.handles()?.store.load_accepted_conversations().await?)
    }

    pub async fn load_unaccepted_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self
            .handles()?
            .store
            .load_unaccepted_conversations()
            .await?)
    }

    pub async fn messages(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        Ok(self.handles()?.store.messages(thread_id).await?)
    }

    pub async fn accept_conversation(&self, thread_id: &ThreadId) -> Result<Conversation> {
        Ok(self.handles()?.store.accept_conversation(thread_id).await?)
    }

    /// Reject a conversation request: drop the thread and its
    /// notifications. For a group this also announces the departure, but
    /// a failed announcement never blocks the local cleanup.
    pub async fn reject_conversation(&self, thread_id: &ThreadId) -> Result<()> {
        let handles = self.handles()?;
        let conversation = handles
            .store
            .load_conversation(thread_id)
            .await?
            .ok_or(ChatError::Storage(StoreError::NotFound))?;
        if let Some(group) = conversation.recipient.group() {
            if let Err(e) = handles.sender.leave_group(group).await {
                warn!(thread_id = %thread_id, error = %e, "departure notice failed during reject");
            }
        }
        handles.store.delete_conversation(thread_id).await?;
        self.notifications.clear_thread(thread_id);
        Ok(())
    }

    pub async fn mute_conversation(&self, thread_id: &ThreadId) -> Result<Conversation> {
        Ok(self.handles()?.store.mute_conversation(thread_id).await?)
    }

    pub async fn unmute_conversation(&self, thread_id: &ThreadId) -> Result<Conversation> {
        Ok(self.handles()?.store.unmute_conversation(thread_id).await?)
    }

    pub async fn reset_unread_message_counter(&self, thread_id: &ThreadId) -> Result<()> {
        Ok(self
            .handles()?
            .store
            .reset_unread_message_counter(thread_id)
            .await?)
    }

    pub async fn are_unread_messages(&self) -> Result<bool> {
        Ok(self.handles()?.store.are_unread_messages().await?)
    }

    /// Delete a thread and everything in it, including its notifications.
    pub async fn delete_conversation(&self, thread_id: &ThreadId) -> Result<()> {
        self.handles()?.store.delete_conversation(thread_id).await?;
        self.notifications.clear_thread(thread_id);
        Ok(())
    }

    pub async fn delete_message(&self, recipient: &Recipient, message_id: Uuid) -> Result<()> {
        Ok(self
            .handles()?
            .store
            .delete_message(recipient, message_id)
            .await?)
    }

    // -----------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------

    pub async fn create_group(&self, title: &str, members: Vec<Address>) -> Result<Conversation> {
        self.handles()?.sender.create_group(title, members).await
    }

    pub async fn update_group(&self, update: GroupUpdate) -> Result<GroupUpdateOutcome> {
        Ok(self.handles()?.sender.update_group(update).await)
    }

    /// Leave a group: announce the departure, then drop the local thread
    /// and its notifications. The announcement must go through; leaving
    /// silently would strand this device in everyone else's member list.
    pub async fn leave_group(&self, thread_id: &ThreadId) -> Result<()> {
        let handles = self.handles()?;
        let conversation = handles
            .store
            .load_conversation(thread_id)
            .await?
            .ok_or(ChatError::Storage(StoreError::NotFound))?;
        let group = conversation.recipient.group().ok_or_else(|| {
            ChatError::InvalidRequest(format!("thread {thread_id} is not a group"))
        })?;
        handles.sender.leave_group(group).await?;
        handles.store.delete_conversation(thread_id).await?;
        self.notifications.clear_thread(thread_id);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Watching and events
    // -----------------------------------------------------------------

    /// Watch `thread_id`: its arrivals stop counting as unread and the
    /// returned streams carry its changes.
    pub fn register_for_changes(&self, thread_id: &ThreadId) -> Result<ConversationEvents> {
        Ok(self.handles()?.store.register_for_changes(thread_id))
    }

    pub fn register_for_deleted_messages(
        &self,
        thread_id: &ThreadId,
    ) -> Result<broadcast::Receiver<ChatMessage>> {
        Ok(self
            .handles()?
            .store
            .register_for_deleted_messages(thread_id))
    }

    /// Release the watch, unless another screen has taken it over since.
    pub fn stop_listening_for_changes(&self, thread_id: &ThreadId) -> Result<()> {
        self.handles()?.store.stop_listening_for_changes(thread_id);
        Ok(())
    }

    /// Global stream of conversation mutations, independent of the watch.
    pub fn subscribe_conversation_changes(&self) -> Result<broadcast::Receiver<Conversation>> {
        Ok(self.handles()?.store.subscribe_conversation_changes())
    }

    /// Live feed of inbound messages as they land in the store.
    pub fn subscribe_incoming(&self) -> Result<broadcast::Receiver<IncomingMessage>> {
        Ok(self.handles()?.receiver.subscribe_incoming())
    }

    /// Wait for the next inbound message. Push wakeups call this to fetch
    /// the message behind the notification.
    pub async fn fetch_latest_message(&self) -> Result<IncomingMessage> {
        self.handles()?.receiver.fetch_latest_message().await
    }

    // -----------------------------------------------------------------
    // Push notifications
    // -----------------------------------------------------------------

    /// Stop the inbound pump while keeping the session ready; the
    /// backgrounding counterpart of [`resume_message_receiving`]. Sends
    /// and queries keep working, and arrivals queue at the backend until
    /// the pump resumes.
    ///
    /// [`resume_message_receiving`]: ChatSession::resume_message_receiving
    pub async fn disconnect(&self) -> Result<()> {
        self.handles()?.receiver.shutdown().await;
        Ok(())
    }

    /// Start the inbound pump if the device is registered. Push wakeups
    /// call this before [`fetch_latest_message`] so a backgrounded app
    /// resumes pulling without a full re-init.
    ///
    /// [`fetch_latest_message`]: ChatSession::fetch_latest_message
    pub fn resume_message_receiving(&self) -> Result<()> {
        let handles = self.handles()?;
        match handles.registrar.state() {
            RegistrationState::Registered { .. } => handles.receiver.start(),
            state => debug!(?state, "not resuming the receiver while unregistered"),
        }
        Ok(())
    }

    pub async fn register_push_token(&self, token: &str) -> Result<()> {
        self.handles()?.registrar.set_push_token(token).await
    }

    pub async fn unregister_push_token(&self) -> Result<()> {
        self.handles()?.registrar.clear_push_token().await
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn handles(&self) -> Result<Arc<SessionHandles<T>>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            SessionState::Ready(handles) => Ok(Arc::clone(handles)),
            _ => Err(ChatError::Uninitialized),
        }
    }

    fn set_state(&self, state: SessionState<T>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn build_handles(
        &self,
        identity: &Identity,
        transport: Arc<T>,
    ) -> Result<Arc<SessionHandles<T>>> {
        let address = identity.address();
        let database = self.open_database(&identity.derive_storage_key())?;
        let store = Arc::new(ConversationStore::new(Arc::new(Mutex::new(database))));

        let registrar = Arc::new(Registrar::new(
            Arc::clone(&transport),
            Arc::clone(&self.prefs),
            device_credentials(identity),
        ));
        let sender = MessageSender::new(address.clone(), Arc::clone(&store), Arc::clone(&transport));
        let receiver = Arc::new(MessageReceiver::new(
            Arc::clone(&store),
            Arc::clone(&transport),
        ));

        match registrar.ensure_registered().await {
            Ok(()) => receiver.start(),
            Err(e) => {
                warn!(error = %e, "initial registration failed, retrying when connectivity returns")
            }
        }

        let watcher = spawn_connectivity_watcher(
            transport.connectivity(),
            Arc::clone(&registrar),
            Arc::clone(&receiver),
        );

        Ok(Arc::new(SessionHandles {
            address,
            store,
            sender,
            receiver,
            registrar,
            watcher: Mutex::new(Some(watcher)),
        }))
    }

    fn open_database(&self, db_key: &[u8; 32]) -> Result<Database> {
        match &self.config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(StoreError::from)?;
                Ok(Database::open_at(&dir.join("satchel.db"), db_key)?)
            }
            None => Ok(Database::new(db_key)?),
        }
    }
}

/// React to offline-to-online transitions by re-registering and starting
/// the inbound pump. Repeated online ticks without a dip are ignored.
fn spawn_connectivity_watcher<T: Transport>(
    mut connectivity: watch::Receiver<bool>,
    registrar: Arc<Registrar<T>>,
    receiver: Arc<MessageReceiver<T>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut was_online = *connectivity.borrow();
        while connectivity.changed().await.is_ok() {
            let online = *connectivity.borrow();
            if online && !was_online {
                info!("connectivity restored, refreshing registration");
                match registrar.refresh_with_onboarding().await {
                    Ok(()) => receiver.start(),
                    Err(e) => warn!(error = %e, "registration refresh failed"),
                }
            }
            was_online = online;
        }
        debug!("connectivity watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryNetwork, InMemoryTransport};
    use crate::prefs::MemoryPrefs;
    use chrono::Utc;
    use satchel_shared::payload::OutboundEnvelope;
    use satchel_store::SendState;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;

    struct RecordingNotifications {
        cleared: StdMutex<Vec<ThreadId>>,
    }

    impl RecordingNotifications {
        fn new() -> Self {
            Self {
                cleared: StdMutex::new(Vec::new()),
            }
        }

        fn cleared(&self) -> Vec<ThreadId> {
            self.cleared.lock().unwrap().clone()
        }
    }

    impl NotificationSink for RecordingNotifications {
        fn clear_thread(&self, thread_id: &ThreadId) {
            self.cleared.lock().unwrap().push(thread_id.clone());
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        identity: Identity,
        transport: Arc<InMemoryTransport>,
        notifications: Arc<RecordingNotifications>,
        session: ChatSession<InMemoryTransport>,
    }

    impl Fixture {
        fn address(&self) -> Address {
            self.identity.address()
        }

        async fn init(&self) {
            self.session
                .init(&self.identity, Arc::clone(&self.transport))
                .await
                .unwrap();
        }
    }

    fn fixture(network: &Arc<InMemoryNetwork>, secret: u8) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::from_secret_bytes(&[secret; 32]);
        let transport = network.transport(identity.address());
        let notifications = Arc::new(RecordingNotifications::new());
        let session = ChatSession::new(
            SessionConfig {
                server_url: "mem://hub".to_string(),
                data_dir: Some(dir.path().to_path_buf()),
                ..SessionConfig::default()
            },
            Arc::new(MemoryPrefs::new()),
            notifications.clone(),
        );
        Fixture {
            _dir: dir,
            identity,
            transport,
            notifications,
            session,
        }
    }

    fn text(body: &str) -> Payload {
        Payload::Text {
            body: body.to_string(),
        }
    }

    fn user(address: Address) -> Recipient {
        Recipient::User(User::new(address))
    }

    fn envelope(payload: &Payload) -> OutboundEnvelope {
        OutboundEnvelope {
            group: None,
            content: payload.encode().unwrap(),
            sent_at: Utc::now(),
        }
    }

    async fn recv<V: Clone>(rx: &mut broadcast::Receiver<V>) -> V {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition was never reached");
    }

    #[tokio::test]
    async fn operations_before_init_are_rejected() {
        let network = InMemoryNetwork::new();
        let f = fixture(&network, 1);

        assert!(!f.session.is_ready());
        assert!(matches!(
            f.session.send_message(&user(Address([9; 32])), text("x")),
            Err(ChatError::Uninitialized)
        ));
        assert!(matches!(
            f.session.load_accepted_conversations().await,
            Err(ChatError::Uninitialized)
        ));
        assert!(matches!(
            f.session.fetch_latest_message().await,
            Err(ChatError::Uninitialized)
        ));
        assert!(matches!(
            f.session.register_push_token("t").await,
            Err(ChatError::Uninitialized)
        ));
    }

    #[tokio::test]
    async fn two_devices_exchange_messages() {
        let network = InMemoryNetwork::new();
        let alice = fixture(&network, 1);
        let bob = fixture(&network, 2);
        alice.init().await;
        bob.init().await;

        let mut bob_arrivals = bob.session.subscribe_incoming().unwrap();
        alice
            .session
            .send_message(&user(bob.address()), text("hello bob"))
            .unwrap();

        let incoming = recv(&mut bob_arrivals).await;
        assert_eq!(incoming.message.sender, alice.address());
        assert_eq!(incoming.message.payload, text("hello bob"));
        // An unsolicited first message lands as a conversation request.
        assert!(!incoming.conversation.status.is_accepted);

        bob.session
            .accept_conversation(&incoming.conversation.thread_id)
            .await
            .unwrap();

        let mut alice_arrivals = alice.session.subscribe_incoming().unwrap();
        bob.session
            .send_message(&user(alice.address()), text("hi alice"))
            .unwrap();
        let reply = recv(&mut alice_arrivals).await;
        assert_eq!(reply.message.payload, text("hi alice"));
    }

    #[tokio::test]
    async fn repeated_init_reuses_the_running_session() {
        let network = InMemoryNetwork::new();
        let f = fixture(&network, 1);
        f.init().await;
        assert_eq!(f.transport.registration_attempts(), 1);

        f.init().await;
        assert!(f.session.is_ready());
        assert_eq!(f.transport.registration_attempts(), 1);
        assert!(matches!(
            f.session.registration_state().unwrap(),
            RegistrationState::Registered { .. }
        ));
    }

    #[tokio::test]
    async fn offline_init_registers_once_connectivity_returns() {
        let network = InMemoryNetwork::new();
        let alice = fixture(&network, 1);
        alice.transport.set_online(false);

        alice.init().await;
        assert!(alice.session.is_ready());
        assert_eq!(alice.transport.registration_attempts(), 0);

        // A peer writes while this device is unreachable; the envelope
        // queues up server-side.
        let mut arrivals = alice.session.subscribe_incoming().unwrap();
        let bob = network.transport(Identity::from_secret_bytes(&[2; 32]).address());
        bob.send(&alice.address(), envelope(&text("you there?")))
            .await
            .unwrap();

        alice.transport.set_online(true);
        let incoming = recv(&mut arrivals).await;
        assert_eq!(incoming.message.payload, text("you there?"));
        assert_eq!(alice.transport.registration_attempts(), 1);
    }

    #[tokio::test]
    async fn connectivity_edges_reclaim_push_without_reregistering() {
        let network = InMemoryNetwork::new();
        let f = fixture(&network, 1);
        f.init().await;
        assert_eq!(f.transport.registration_attempts(), 1);
        f.session.register_push_token("tok").await.unwrap();
        assert_eq!(f.transport.push_registrations(), 1);

        // Repeated "still online" ticks are not restore edges.
        f.transport.set_online(true);
        tokio::task::yield_now().await;
        f.transport.set_online(true);
        tokio::task::yield_now().await;
        assert_eq!(f.transport.push_registrations(), 1);

        // A real dip and restore re-claims the push token, but the
        // already-registered device is not registered again.
        f.transport.set_online(false);
        tokio::task::yield_now().await;
        f.transport.set_online(true);
        wait_until(|| f.transport.push_registrations() == 2).await;
        assert_eq!(f.transport.registration_attempts(), 1);
    }

    #[tokio::test]
    async fn resume_receiving_is_gated_on_registration() {
        let network = InMemoryNetwork::new();
        let f = fixture(&network, 1);
        f.transport.set_online(false);
        f.init().await;

        // Unregistered: nothing to resume, and no registration attempt.
        f.session.resume_message_receiving().unwrap();
        assert_eq!(f.transport.registration_attempts(), 0);

        f.transport.set_online(true);
        wait_until(|| {
            matches!(
                f.session.registration_state(),
                Ok(RegistrationState::Registered { .. })
            )
        })
        .await;
        f.session.resume_message_receiving().unwrap();

        let mut arrivals = f.session.subscribe_incoming().unwrap();
        let bob = network.transport(Identity::from_secret_bytes(&[2; 32]).address());
        bob.send(&f.address(), envelope(&text("ping")))
            .await
            .unwrap();
        assert_eq!(recv(&mut arrivals).await.message.payload, text("ping"));
    }

    #[tokio::test]
    async fn disconnect_pauses_receiving_until_resumed() {
        let network = InMemoryNetwork::new();
        let f = fixture(&network, 1);
        f.init().await;
        let bob_address = Identity::from_secret_bytes(&[2; 32]).address();
        let bob = network.transport(bob_address.clone());

        f.session.disconnect().await.unwrap();
        assert!(f.session.is_ready());

        // Outbound traffic is unaffected by a paused pump.
        f.session
            .send_message(&user(bob_address), text("still sending"))
            .unwrap();
        assert_eq!(
            Payload::decode(&bob.next_envelope().await.unwrap().content).unwrap(),
            text("still sending")
        );

        // Arrivals queue in the mailbox while the pump is stopped and
        // land once it resumes.
        bob.send(&f.address(), envelope(&text("while backgrounded")))
            .await
            .unwrap();
        let mut arrivals = f.session.subscribe_incoming().unwrap();
        f.session.resume_message_receiving().unwrap();

        let incoming = recv(&mut arrivals).await;
        assert_eq!(incoming.message.payload, text("while backgrounded"));
    }

    #[tokio::test]
    async fn clear_tears_down_and_init_rebuilds() {
        let network = InMemoryNetwork::new();
        let f = fixture(&network, 1);
        f.init().await;

        let bob = network.transport(Identity::from_secret_bytes(&[2; 32]).address());
        let to_bob = user(Identity::from_secret_bytes(&[2; 32]).address());
        f.session.send_message(&to_bob, text("before")).unwrap();
        bob.next_envelope().await.unwrap();

        f.session.clear().await;
        assert!(!f.session.is_ready());
        assert!(matches!(
            f.session.send_message(&to_bob, text("after")),
            Err(ChatError::Uninitialized)
        ));
        f.session.clear().await;

        // Same identity, same data directory: history survives.
        f.init().await;
        let messages = f.session.messages(&to_bob.thread_id()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, text("before"));

        f.session.send_message(&to_bob, text("after")).unwrap();
        bob.next_envelope().await.unwrap();
    }

    #[tokio::test]
    async fn leaving_a_group_announces_and_cleans_up() {
        let network = InMemoryNetwork::new();
        let alice = fixture(&network, 1);
        alice.init().await;
        let bob_address = Identity::from_secret_bytes(&[2; 32]).address();
        let bob = network.transport(bob_address.clone());

        let conversation = alice
            .session
            .create_group("hiking", vec![bob_address])
            .await
            .unwrap();
        bob.next_envelope().await.unwrap();

        alice
            .session
            .leave_group(&conversation.thread_id)
            .await
            .unwrap();

        let leave = bob.next_envelope().await.unwrap();
        assert_eq!(Payload::decode(&leave.content).unwrap(), Payload::GroupLeave);
        assert!(alice
            .session
            .load_conversation(&conversation.thread_id)
            .await
            .unwrap()
            .is_none());
        assert!(alice
            .notifications
            .cleared()
            .contains(&conversation.thread_id));
    }

    #[tokio::test]
    async fn rejecting_a_request_deletes_thread_and_notifications() {
        let network = InMemoryNetwork::new();
        let alice = fixture(&network, 1);
        alice.init().await;

        let mut arrivals = alice.session.subscribe_incoming().unwrap();
        let bob = network.transport(Identity::from_secret_bytes(&[2; 32]).address());
        bob.send(&alice.address(), envelope(&text("buy my coin")))
            .await
            .unwrap();
        let incoming = recv(&mut arrivals).await;

        let requests = alice.session.load_unaccepted_conversations().await.unwrap();
        assert_eq!(requests.len(), 1);

        alice
            .session
            .reject_conversation(&incoming.conversation.thread_id)
            .await
            .unwrap();

        assert!(alice
            .session
            .load_conversation(&incoming.conversation.thread_id)
            .await
            .unwrap()
            .is_none());
        assert!(alice
            .session
            .load_unaccepted_conversations()
            .await
            .unwrap()
            .is_empty());
        assert!(alice
            .notifications
            .cleared()
            .contains(&incoming.conversation.thread_id));
    }

    #[tokio::test]
    async fn first_contact_handshake_is_transient() {
        let network = InMemoryNetwork::new();
        let alice = fixture(&network, 1);
        alice.init().await;
        let bob_address = Identity::from_secret_bytes(&[2; 32]).address();
        let bob = network.transport(bob_address.clone());

        alice
            .session
            .send_init_message(&bob_address, "0xdeadbeef")
            .unwrap();

        let inbound = bob.next_envelope().await.unwrap();
        match Payload::decode(&inbound.content).unwrap() {
            Payload::Init {
                payment_address,
                language,
            } => {
                assert_eq!(payment_address, "0xdeadbeef");
                assert_eq!(language, "en");
            }
            other => panic!("expected init payload, got {other:?}"),
        }
        assert!(alice
            .session
            .load_conversation(&user(bob_address).thread_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failed_send_can_be_resent_from_the_session() {
        let network = InMemoryNetwork::new();
        let alice = fixture(&network, 1);
        alice.init().await;
        let bob_address = Identity::from_secret_bytes(&[2; 32]).address();
        let bob = network.transport(bob_address.clone());
        let to_bob = user(bob_address);

        alice.transport.set_fail_sends(true);
        let mut events = alice
            .session
            .register_for_changes(&to_bob.thread_id())
            .unwrap();
        alice.session.send_message(&to_bob, text("retry me")).unwrap();

        recv(&mut events.new_messages).await;
        let failed = recv(&mut events.updated_messages).await;
        assert_eq!(failed.send_state, SendState::Failed);

        alice.transport.set_fail_sends(false);
        alice.session.resend_message(failed).await.unwrap();

        let resent = recv(&mut events.updated_messages).await;
        assert_eq!(resent.send_state, SendState::Sent);
        assert_eq!(
            Payload::decode(&bob.next_envelope().await.unwrap().content).unwrap(),
            text("retry me")
        );
    }

    #[tokio::test]
    async fn push_token_lifecycle() {
        let network = InMemoryNetwork::new();
        let f = fixture(&network, 1);
        f.init().await;

        f.session.register_push_token("token-1").await.unwrap();
        assert_eq!(f.transport.current_push_token().as_deref(), Some("token-1"));

        f.session.unregister_push_token().await.unwrap();
        assert_eq!(f.transport.current_push_token(), None);
    }
}

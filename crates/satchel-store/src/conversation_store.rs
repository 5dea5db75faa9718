//! The conversation store.
//!
//! Single owner of every conversation/message write and the pub/sub hub for
//! UI observers. All SQL runs on the blocking thread pool behind one shared
//! [`Database`] handle, so storage transactions are serialized; subscribers
//! get their events strictly after the producing transaction has committed.
//!
//! Event scoping follows the "watched thread" model: exactly one
//! conversation is considered foreground at a time. Fine-grained events
//! (new/updated/deleted message, conversation-updated) are delivered only
//! for the watched thread, while conversation-changed fires for every
//! mutation and feeds conversation-list views.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use satchel_shared::constants::{MAX_AVATAR_BYTES, TIME_SEPARATOR_GAP_MINUTES};
use satchel_shared::payload::StatusPayload;
use satchel_shared::{Address, GroupId, ThreadId};

use crate::conversations;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ChatMessage, Conversation, ConversationStatus, Group, Recipient};

/// Capacity of each broadcast channel. A subscriber that falls further
/// behind than this observes `RecvError::Lagged` and can reload.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event streams scoped to the watched thread, handed out by
/// [`ConversationStore::register_for_changes`].
pub struct ConversationEvents {
    pub new_messages: broadcast::Receiver<ChatMessage>,
    pub updated_messages: broadcast::Receiver<ChatMessage>,
    pub conversation_updated: broadcast::Receiver<Conversation>,
}

/// One event produced inside a storage transaction, published after commit.
enum StoreEvent {
    NewMessage(ThreadId, ChatMessage),
    UpdatedMessage(ThreadId, ChatMessage),
    DeletedMessage(ThreadId, ChatMessage),
    ConversationUpdated(Conversation),
    ConversationChanged(Conversation),
}

pub struct ConversationStore {
    db: Arc<Mutex<Database>>,
    /// The single foreground thread; last register wins.
    watched: Mutex<Option<ThreadId>>,
    new_messages: broadcast::Sender<ChatMessage>,
    updated_messages: broadcast::Sender<ChatMessage>,
    deleted_messages: broadcast::Sender<ChatMessage>,
    conversation_updated: broadcast::Sender<Conversation>,
    conversation_changed: broadcast::Sender<Conversation>,
}

impl ConversationStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        let (new_messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (updated_messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (deleted_messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (conversation_updated, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (conversation_changed, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            db,
            watched: Mutex::new(None),
            new_messages,
            updated_messages,
            deleted_messages,
            conversation_updated,
            conversation_changed,
        }
    }

    // -----------------------------------------------------------------
    // Scoped pub/sub
    // -----------------------------------------------------------------

    /// Point the fine-grained event streams at `thread_id` and subscribe.
    /// Registering replaces any previous watch.
    pub fn register_for_changes(&self, thread_id: &ThreadId) -> ConversationEvents {
        self.set_watched(Some(thread_id.clone()));
        ConversationEvents {
            new_messages: self.new_messages.subscribe(),
            updated_messages: self.updated_messages.subscribe(),
            conversation_updated: self.conversation_updated.subscribe(),
        }
    }

    /// Subscribe to message deletions on `thread_id`, also moving the watch.
    pub fn register_for_deleted_messages(
        &self,
        thread_id: &ThreadId,
    ) -> broadcast::Receiver<ChatMessage> {
        self.set_watched(Some(thread_id.clone()));
        self.deleted_messages.subscribe()
    }

    /// Clear the watch, but only if `thread_id` still owns it. A screen
    /// tearing down after its successor already registered must not clobber
    /// the successor's watch.
    pub fn stop_listening_for_changes(&self, thread_id: &ThreadId) {
        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        if watched.as_ref() == Some(thread_id) {
            *watched = None;
        }
    }

    /// Global stream: fires for every conversation mutation regardless of
    /// the watch state.
    pub fn subscribe_conversation_changes(&self) -> broadcast::Receiver<Conversation> {
        self.conversation_changed.subscribe()
    }

    /// The currently watched thread, if any.
    pub fn watched_thread(&self) -> Option<ThreadId> {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_watched(&self, thread_id: Option<ThreadId>) {
        *self.watched.lock().unwrap_or_else(PoisonError::into_inner) = thread_id;
    }

    // -----------------------------------------------------------------
    // Conversations and messages
    // -----------------------------------------------------------------

    /// Idempotent by thread id: creates an accepted empty conversation, or
    /// marks the existing one accepted, leaving its messages, unread count
    /// and muted flag alone.
    pub async fn create_empty_conversation(&self, recipient: &Recipient) -> Result<Conversation> {
        let recipient = recipient.clone();
        self.with_db(move |db| {
            let thread_id = recipient.thread_id();
            let tx = db.conn_mut().transaction()?;
            let mut conversation = match conversations::find_conversation(&tx, &thread_id)? {
                Some(existing) => existing,
                None => Conversation::new(recipient),
            };
            conversation.status.is_accepted = true;
            conversations::upsert_conversation(&tx, &conversation)?;
            tx.commit()?;
            Ok(conversation)
        })
        .await
    }

    /// Persist a message into its conversation, creating the conversation on
    /// first contact. Inserts a timestamp separator when the gap since the
    /// conversation's last update is large enough, bumps the unread counter
    /// when the thread is not watched and the message counts, and moves the
    /// latest-message pointer. All of it is one transaction; events are
    /// published after commit.
    pub async fn save_message(
        &self,
        recipient: &Recipient,
        message: ChatMessage,
    ) -> Result<Conversation> {
        let recipient = recipient.clone();
        let watched = self.watched_thread();
        let (conversation, events) = self
            .with_db(move |db| {
                let thread_id = recipient.thread_id();
                let tx = db.conn_mut().transaction()?;
                let mut events = Vec::new();
                let mut conversation = match conversations::find_conversation(&tx, &thread_id)? {
                    Some(existing) => existing,
                    None => Conversation::new(recipient.clone()),
                };
                persist_message(&tx, &mut conversation, message, watched.as_ref(), &mut events)?;
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                events.push(StoreEvent::ConversationChanged(conversation.clone()));
                Ok((conversation, events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    /// Overwrite an already-persisted message by identity (delivery state
    /// transitions mostly) and notify watchers with an "updated" event.
    pub async fn update_message(&self, recipient: &Recipient, message: ChatMessage) -> Result<()> {
        let thread_id = recipient.thread_id();
        let events = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                conversations::update_message_row(&tx, &message)?;
                tx.commit()?;
                Ok(vec![StoreEvent::UpdatedMessage(thread_id, message)])
            })
            .await?;
        self.publish(events);
        Ok(())
    }

    /// Delete one message and recompute the conversation's latest-message
    /// pointer from the remaining tail, in insertion order.
    pub async fn delete_message(&self, recipient: &Recipient, message_id: Uuid) -> Result<()> {
        let thread_id = recipient.thread_id();
        let events = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let message = match conversations::find_message(&tx, &message_id)? {
                    Some(m) => m,
                    None => return Err(StoreError::NotFound),
                };
                conversations::delete_message_row(&tx, &message_id)?;

                if let Some(mut conversation) = conversations::find_conversation(&tx, &thread_id)?
                {
                    let tail = conversations::tail_message(&tx, &thread_id)?;
                    if let Some(ref tail_message) = tail {
                        conversation.updated_at = tail_message.created_at;
                    }
                    conversation.latest_message = tail;
                    conversations::upsert_conversation(&tx, &conversation)?;
                }

                tx.commit()?;
                Ok(vec![StoreEvent::DeletedMessage(thread_id, message)])
            })
            .await?;
        self.publish(events);
        Ok(())
    }

    pub async fn load_conversation(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        let thread_id = thread_id.clone();
        self.with_db(move |db| db.conversation(&thread_id)).await
    }

    /// Load a conversation and zero its unread counter in one step; the
    /// conversation-screen entry path.
    pub async fn load_conversation_and_reset_unread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<Conversation>> {
        let thread_id = thread_id.clone();
        let (conversation, events) = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let mut conversation = match conversations::find_conversation(&tx, &thread_id)? {
                    Some(c) => c,
                    None => return Ok((None, Vec::new())),
                };
                conversation.unread_count = 0;
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                let events = vec![StoreEvent::ConversationChanged(conversation.clone())];
                Ok((Some(conversation), events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    pub async fn load_accepted_conversations(&self) -> Result<Vec<Conversation>> {
        self.with_db(|db| db.accepted_conversations()).await
    }

    pub async fn load_unaccepted_conversations(&self) -> Result<Vec<Conversation>> {
        self.with_db(|db| db.unaccepted_conversations()).await
    }

    /// All messages of a thread, in insertion order.
    pub async fn messages(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        let thread_id = thread_id.clone();
        self.with_db(move |db| db.conversation_messages(&thread_id))
            .await
    }

    pub async fn message_by_id(&self, id: Uuid) -> Result<ChatMessage> {
        self.with_db(move |db| db.message_by_id(&id)).await
    }

    /// The thread a message belongs to.
    pub async fn thread_for_message(&self, id: Uuid) -> Result<ThreadId> {
        self.with_db(move |db| db.thread_for_message(&id)).await
    }

    pub async fn mute_conversation(&self, thread_id: &ThreadId) -> Result<Conversation> {
        self.set_status(thread_id, |status| status.is_muted = true)
            .await
    }

    pub async fn unmute_conversation(&self, thread_id: &ThreadId) -> Result<Conversation> {
        self.set_status(thread_id, |status| status.is_muted = false)
            .await
    }

    pub async fn accept_conversation(&self, thread_id: &ThreadId) -> Result<Conversation> {
        self.set_status(thread_id, |status| status.is_accepted = true)
            .await
    }

    /// Zero the unread counter and broadcast conversation-changed. Unknown
    /// threads are a quiet no-op.
    pub async fn reset_unread_message_counter(&self, thread_id: &ThreadId) -> Result<()> {
        let thread_id = thread_id.clone();
        let events = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let mut conversation = match conversations::find_conversation(&tx, &thread_id)? {
                    Some(c) => c,
                    None => {
                        tracing::debug!(thread_id = %thread_id, "reset unread on unknown thread");
                        return Ok(Vec::new());
                    }
                };
                conversation.unread_count = 0;
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                Ok(vec![StoreEvent::ConversationChanged(conversation)])
            })
            .await?;
        self.publish(events);
        Ok(())
    }

    /// Whether any conversation has unread messages.
    pub async fn are_unread_messages(&self) -> Result<bool> {
        self.with_db(|db| db.has_unread_messages()).await
    }

    /// Delete a conversation and its whole message history.
    pub async fn delete_conversation(&self, thread_id: &ThreadId) -> Result<()> {
        let thread_id = thread_id.clone();
        self.with_db(move |db| {
            let tx = db.conn_mut().transaction()?;
            conversations::delete_conversation_row(&tx, &thread_id)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------

    /// Create the local conversation for a freshly allocated group, with a
    /// "group created" status row.
    pub async fn create_group_conversation(
        &self,
        creator: &Address,
        group: &Group,
    ) -> Result<Conversation> {
        let creator = creator.clone();
        let group = group.clone();
        let watched = self.watched_thread();
        let (conversation, events) = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let mut events = Vec::new();
                let mut conversation =
                    match conversations::find_conversation(&tx, &group.thread_id())? {
                        Some(existing) => existing,
                        None => {
                            let mut c = Conversation::new(Recipient::Group(group.clone()));
                            c.status.is_accepted = true;
                            c
                        }
                    };
                let status = ChatMessage::local_status(creator, StatusPayload::GroupCreated);
                persist_message(&tx, &mut conversation, status, watched.as_ref(), &mut events)?;
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                events.push(StoreEvent::ConversationChanged(conversation.clone()));
                Ok((conversation, events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    /// Add members to a group thread, appending a "members added" status row
    /// for the ones actually new.
    pub async fn add_group_members(
        &self,
        actor: &Address,
        group_id: &GroupId,
        members: &[Address],
    ) -> Result<Conversation> {
        let actor = actor.clone();
        let thread_id = group_id.thread_id();
        let members = members.to_vec();
        let watched = self.watched_thread();
        let (conversation, events) = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let mut events = Vec::new();
                let mut conversation = load_group_conversation(&tx, &thread_id)?;
                let added = conversation
                    .recipient
                    .group_mut()
                    .map(|group| group.add_members(&members))
                    .unwrap_or_default();
                if !added.is_empty() {
                    let status =
                        ChatMessage::local_status(actor, StatusPayload::MembersAdded { added });
                    persist_message(&tx, &mut conversation, status, watched.as_ref(), &mut events)?;
                }
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                events.push(StoreEvent::ConversationChanged(conversation.clone()));
                Ok((conversation, events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    /// Rename a group thread, appending a "name changed" status row when the
    /// title actually changes.
    pub async fn rename_group(
        &self,
        actor: &Address,
        group_id: &GroupId,
        title: &str,
    ) -> Result<Conversation> {
        let actor = actor.clone();
        let thread_id = group_id.thread_id();
        let title = title.to_string();
        let watched = self.watched_thread();
        let (conversation, events) = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let mut events = Vec::new();
                let mut conversation = load_group_conversation(&tx, &thread_id)?;
                let changed = conversation
                    .recipient
                    .group_mut()
                    .map(|group| {
                        if group.title == title {
                            false
                        } else {
                            group.title = title.clone();
                            true
                        }
                    })
                    .unwrap_or(false);
                if changed {
                    let status = ChatMessage::local_status(
                        actor,
                        StatusPayload::NameChanged {
                            title: title.clone(),
                        },
                    );
                    persist_message(&tx, &mut conversation, status, watched.as_ref(), &mut events)?;
                }
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                events.push(StoreEvent::ConversationChanged(conversation.clone()));
                Ok((conversation, events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    /// Store a group's avatar reference. Avatar swaps are silent (no status
    /// row). Fails when the avatar exceeds [`MAX_AVATAR_BYTES`].
    pub async fn save_group_avatar(
        &self,
        group_id: &GroupId,
        avatar: &str,
    ) -> Result<Conversation> {
        if avatar.len() > MAX_AVATAR_BYTES {
            return Err(StoreError::AvatarTooLarge);
        }
        let thread_id = group_id.thread_id();
        let avatar = avatar.to_string();
        let (conversation, events) = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let mut conversation = load_group_conversation(&tx, &thread_id)?;
                if let Some(group) = conversation.recipient.group_mut() {
                    group.avatar = Some(avatar);
                }
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                let events = vec![StoreEvent::ConversationChanged(conversation.clone())];
                Ok((conversation, events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    /// Drop a member from a group thread, appending a "member left" status
    /// row when they were actually present.
    pub async fn remove_group_member(
        &self,
        group_id: &GroupId,
        member: &Address,
    ) -> Result<Conversation> {
        let member = member.clone();
        let thread_id = group_id.thread_id();
        let watched = self.watched_thread();
        let (conversation, events) = self
            .with_db(move |db| {
                let tx = db.conn_mut().transaction()?;
                let mut events = Vec::new();
                let mut conversation = load_group_conversation(&tx, &thread_id)?;
                let removed = conversation
                    .recipient
                    .group_mut()
                    .map(|group| group.remove_member(&member))
                    .unwrap_or(false);
                if removed {
                    let status = ChatMessage::local_status(
                        member.clone(),
                        StatusPayload::MemberLeft { member },
                    );
                    persist_message(&tx, &mut conversation, status, watched.as_ref(), &mut events)?;
                }
                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                events.push(StoreEvent::ConversationChanged(conversation.clone()));
                Ok((conversation, events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    /// Reconcile a thread with a group snapshot received from the wire:
    /// merge membership, apply title/avatar, append status rows for the
    /// diff. Creates the conversation when the group is new to this device.
    pub async fn apply_group_snapshot(
        &self,
        actor: &Address,
        group: &Group,
    ) -> Result<Conversation> {
        let actor = actor.clone();
        let group = group.clone();
        let watched = self.watched_thread();
        let (conversation, events) = self
            .with_db(move |db| {
                let thread_id = group.thread_id();
                let tx = db.conn_mut().transaction()?;
                let mut events = Vec::new();

                let mut conversation = match conversations::find_conversation(&tx, &thread_id)? {
                    Some(c) => c,
                    None => {
                        // First sight of this group: the local user was added.
                        let mut c = Conversation::new(Recipient::Group(group.clone()));
                        c.status.is_accepted = true;
                        let status = ChatMessage::local_status(
                            actor.clone(),
                            StatusPayload::AddedToGroup {
                                title: group.title.clone(),
                            },
                        );
                        persist_message(&tx, &mut c, status, watched.as_ref(), &mut events)?;
                        conversations::upsert_conversation(&tx, &c)?;
                        tx.commit()?;
                        events.push(StoreEvent::ConversationUpdated(c.clone()));
                        events.push(StoreEvent::ConversationChanged(c.clone()));
                        return Ok((c, events));
                    }
                };

                let mut merged = match conversation.recipient.group() {
                    Some(g) => g.clone(),
                    None => {
                        return Err(StoreError::Malformed(format!(
                            "thread {thread_id} is not a group"
                        )))
                    }
                };

                let added = merged.add_members(&group.member_ids);
                let renamed = merged.title != group.title;
                if renamed {
                    merged.title = group.title.clone();
                }
                match &group.avatar {
                    Some(avatar) if avatar.len() > MAX_AVATAR_BYTES => {
                        tracing::warn!(
                            group_id = %group.id,
                            size = avatar.len(),
                            "ignoring oversized avatar in group snapshot"
                        );
                    }
                    Some(avatar) => merged.avatar = Some(avatar.clone()),
                    None => {}
                }
                conversation.recipient = Recipient::Group(merged);

                if !added.is_empty() {
                    let status = ChatMessage::local_status(
                        actor.clone(),
                        StatusPayload::MembersAdded { added },
                    );
                    persist_message(&tx, &mut conversation, status, watched.as_ref(), &mut events)?;
                }
                if renamed {
                    let status = ChatMessage::local_status(
                        actor,
                        StatusPayload::NameChanged {
                            title: group.title.clone(),
                        },
                    );
                    persist_message(&tx, &mut conversation, status, watched.as_ref(), &mut events)?;
                }

                conversations::upsert_conversation(&tx, &conversation)?;
                tx.commit()?;
                events.push(StoreEvent::ConversationUpdated(conversation.clone()));
                events.push(StoreEvent::ConversationChanged(conversation.clone()));
                Ok((conversation, events))
            })
            .await?;
        self.publish(events);
        Ok(conversation)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Run a closure against the database on the blocking pool. The mutex
    /// serializes all storage work behind the one connection.
    async fn with_db<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut db = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut db)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn set_status<F>(&self, thread_id: &ThreadId, mutate: F) -> Result<Conversation>
    where
        F: FnOnce(&mut ConversationStatus) + Send + 'static,
    {
        let thread_id = thread_id.clone();
        self.with_db(move |db| {
            let tx = db.conn_mut().transaction()?;
            let mut conversation = match conversations::find_conversation(&tx, &thread_id)? {
                Some(c) => c,
                None => return Err(StoreError::NotFound),
            };
            mutate(&mut conversation.status);
            conversations::upsert_conversation(&tx, &conversation)?;
            tx.commit()?;
            Ok(conversation)
        })
        .await
    }

    /// Fan events out to subscribers. Fine-grained events only go to the
    /// watched thread; conversation-changed always goes out. Send errors
    /// mean nobody is subscribed, which is fine.
    fn publish(&self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        let watched = self.watched_thread();
        for event in events {
            match event {
                StoreEvent::NewMessage(thread_id, message) => {
                    if watched.as_ref() == Some(&thread_id) {
                        let _ = self.new_messages.send(message);
                    }
                }
                StoreEvent::UpdatedMessage(thread_id, message) => {
                    if watched.as_ref() == Some(&thread_id) {
                        let _ = self.updated_messages.send(message);
                    }
                }
                StoreEvent::DeletedMessage(thread_id, message) => {
                    if watched.as_ref() == Some(&thread_id) {
                        let _ = self.deleted_messages.send(message);
                    }
                }
                StoreEvent::ConversationUpdated(conversation) => {
                    if watched.as_ref() == Some(&conversation.thread_id) {
                        let _ = self.conversation_updated.send(conversation);
                    }
                }
                StoreEvent::ConversationChanged(conversation) => {
                    let _ = self.conversation_changed.send(conversation);
                }
            }
        }
    }
}

/// Shared insert path for real and synthetic messages: timestamp separator,
/// message row, unread accounting, latest-message pointer. The caller is
/// responsible for upserting the conversation and committing.
fn persist_message(
    conn: &rusqlite::Connection,
    conversation: &mut Conversation,
    message: ChatMessage,
    watched: Option<&ThreadId>,
    events: &mut Vec<StoreEvent>,
) -> Result<()> {
    let thread_id = conversation.thread_id.clone();

    if message.is_user_visible() && separator_due(conversation, &message) {
        let separator = ChatMessage::timestamp_separator(message.sender.clone());
        conversations::insert_message(conn, &thread_id, &separator)?;
        events.push(StoreEvent::NewMessage(thread_id.clone(), separator));
    }

    conversations::insert_message(conn, &thread_id, &message)?;

    let is_watched = watched == Some(&thread_id);
    if !is_watched && message.is_user_visible() && !message.is_local_status() {
        conversation.unread_count += 1;
    }

    conversation.updated_at = message.created_at;
    conversation.latest_message = Some(message.clone());
    events.push(StoreEvent::NewMessage(thread_id, message));
    Ok(())
}

/// Whether enough time passed since the conversation's last update that the
/// UI should show a time separator before this message.
fn separator_due(conversation: &Conversation, message: &ChatMessage) -> bool {
    message.created_at - conversation.updated_at > Duration::minutes(TIME_SEPARATOR_GAP_MINUTES)
}

fn load_group_conversation(
    conn: &rusqlite::Connection,
    thread_id: &ThreadId,
) -> Result<Conversation> {
    let conversation = match conversations::find_conversation(conn, thread_id)? {
        Some(c) => c,
        None => return Err(StoreError::NotFound),
    };
    if !conversation.is_group() {
        return Err(StoreError::Malformed(format!(
            "thread {thread_id} is not a group"
        )));
    }
    Ok(conversation)
}

//! In-memory transport hub.
//!
//! A process-local stand-in for the chat backend: every device gets an
//! [`InMemoryTransport`] from a shared [`InMemoryNetwork`], and envelopes
//! sent by one device land in the mailbox of another. Tests drive
//! connectivity flaps and delivery failures through it; local tooling can
//! run a whole multi-device conversation without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use satchel_shared::payload::{InboundEnvelope, OutboundEnvelope};
use satchel_shared::{Address, GroupId};

use crate::transport::{DeviceCredentials, RegistrationReceipt, Transport, TransportError};

/// The shared hub connecting every in-memory transport.
#[derive(Default)]
pub struct InMemoryNetwork {
    mailboxes: Mutex<HashMap<Address, mpsc::UnboundedSender<InboundEnvelope>>>,
    registered: Mutex<Vec<Address>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport for `address` and plug its mailbox into the hub.
    pub fn transport(self: &Arc<Self>, address: Address) -> Arc<InMemoryTransport> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), inbox_tx);

        let (online_tx, online_rx) = watch::channel(true);
        Arc::new(InMemoryTransport {
            address,
            network: Arc::clone(self),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            online_tx,
            online_rx,
            fail_sends: AtomicBool::new(false),
            registration_attempts: AtomicUsize::new(0),
            push_token: Mutex::new(None),
            push_registrations: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Addresses that completed device registration, in order.
    pub fn registered_addresses(&self) -> Vec<Address> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(&self, from: &Address, to: &Address, envelope: &OutboundEnvelope) {
        let mailboxes = self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner);
        match mailboxes.get(to) {
            Some(mailbox) => {
                let _ = mailbox.send(InboundEnvelope {
                    sender: from.clone(),
                    group: envelope.group.clone(),
                    content: envelope.content.clone(),
                    sent_at: envelope.sent_at,
                });
            }
            None => {
                // The backend would queue for devices that never connected;
                // the hub just drops.
                debug!(recipient = %to, "dropping envelope for unknown device");
            }
        }
    }

    fn record_registration(&self, address: &Address) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address.clone());
    }
}

/// One device's connection to the [`InMemoryNetwork`].
pub struct InMemoryTransport {
    address: Address,
    network: Arc<InMemoryNetwork>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEnvelope>>,
    online_tx: watch::Sender<bool>,
    online_rx: watch::Receiver<bool>,
    fail_sends: AtomicBool,
    registration_attempts: AtomicUsize,
    push_token: Mutex<Option<String>>,
    push_registrations: AtomicUsize,
    sent: Mutex<Vec<(Address, OutboundEnvelope)>>,
}

impl InMemoryTransport {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Flip the connectivity signal. `true -> false -> true` produces the
    /// restore edge the session reacts to.
    pub fn set_online(&self, online: bool) {
        let _ = self.online_tx.send(online);
    }

    /// Make every subsequent `send`/`send_to_group` fail until reset.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// How many times `register` was called on this transport.
    pub fn registration_attempts(&self) -> usize {
        self.registration_attempts.load(Ordering::SeqCst)
    }

    /// How many times a push token was (re-)registered.
    pub fn push_registrations(&self) -> usize {
        self.push_registrations.load(Ordering::SeqCst)
    }

    pub fn current_push_token(&self) -> Option<String> {
        self.push_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every envelope this transport delivered, with its recipient.
    pub fn sent_envelopes(&self) -> Vec<(Address, OutboundEnvelope)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_online(&self) -> bool {
        *self.online_rx.borrow()
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn check_send(&self) -> Result<(), TransportError> {
        self.check_online()?;
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Network("injected send failure".to_string()));
        }
        Ok(())
    }

    fn record_sent(&self, recipient: &Address, envelope: &OutboundEnvelope) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((recipient.clone(), envelope.clone()));
    }
}

impl Transport for InMemoryTransport {
    async fn register(
        &self,
        credentials: &DeviceCredentials,
    ) -> Result<RegistrationReceipt, TransportError> {
        self.check_online()?;
        self.registration_attempts.fetch_add(1, Ordering::SeqCst);
        self.network.record_registration(&credentials.address);
        Ok(RegistrationReceipt {
            address: credentials.address.clone(),
            registered_at: Utc::now(),
        })
    }

    async fn send(
        &self,
        recipient: &Address,
        envelope: OutboundEnvelope,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        self.record_sent(recipient, &envelope);
        self.network.deliver(&self.address, recipient, &envelope);
        Ok(())
    }

    async fn send_to_group(
        &self,
        members: &[Address],
        envelope: OutboundEnvelope,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        for member in members {
            if member == &self.address {
                continue;
            }
            self.record_sent(member, &envelope);
            self.network.deliver(&self.address, member, &envelope);
        }
        Ok(())
    }

    async fn allocate_group(&self) -> Result<GroupId, TransportError> {
        self.check_online()?;
        Ok(GroupId::random())
    }

    async fn next_envelope(&self) -> Option<InboundEnvelope> {
        self.inbox.lock().await.recv().await
    }

    async fn register_push_token(&self, token: &str) -> Result<(), TransportError> {
        self.check_online()?;
        *self
            .push_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        self.push_registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unregister_push_token(&self) -> Result<(), TransportError> {
        self.check_online()?;
        *self
            .push_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address([byte; 32])
    }

    fn envelope(content: &[u8]) -> OutboundEnvelope {
        OutboundEnvelope {
            group: None,
            content: content.to_vec(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn envelopes_cross_the_hub() {
        let network = InMemoryNetwork::new();
        let alice = network.transport(addr(1));
        let bob = network.transport(addr(2));

        alice.send(&addr(2), envelope(b"hi bob")).await.unwrap();

        let inbound = bob.next_envelope().await.unwrap();
        assert_eq!(inbound.sender, addr(1));
        assert_eq!(inbound.content, b"hi bob");
    }

    #[tokio::test]
    async fn group_fanout_skips_the_sender() {
        let network = InMemoryNetwork::new();
        let alice = network.transport(addr(1));
        let bob = network.transport(addr(2));
        let carol = network.transport(addr(3));

        alice
            .send_to_group(&[addr(1), addr(2), addr(3)], envelope(b"group"))
            .await
            .unwrap();

        assert_eq!(bob.next_envelope().await.unwrap().content, b"group");
        assert_eq!(carol.next_envelope().await.unwrap().content, b"group");
        assert_eq!(alice.sent_envelopes().len(), 2);
    }

    #[tokio::test]
    async fn offline_transport_refuses_operations() {
        let network = InMemoryNetwork::new();
        let alice = network.transport(addr(1));
        alice.set_online(false);

        assert!(matches!(
            alice.send(&addr(2), envelope(b"x")).await,
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            alice.allocate_group().await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn injected_send_failures() {
        let network = InMemoryNetwork::new();
        let alice = network.transport(addr(1));
        let _bob = network.transport(addr(2));
        alice.set_fail_sends(true);

        assert!(matches!(
            alice.send(&addr(2), envelope(b"x")).await,
            Err(TransportError::Network(_))
        ));

        alice.set_fail_sends(false);
        alice.send(&addr(2), envelope(b"x")).await.unwrap();
    }

    #[tokio::test]
    async fn registration_is_counted() {
        let network = InMemoryNetwork::new();
        let alice = network.transport(addr(1));
        let credentials = DeviceCredentials {
            address: addr(1),
            password: "pw".to_string(),
            signaling_key: "sk".to_string(),
            registration_id: 7,
        };

        alice.register(&credentials).await.unwrap();
        alice.register(&credentials).await.unwrap();

        assert_eq!(alice.registration_attempts(), 2);
        assert_eq!(network.registered_addresses(), vec![addr(1), addr(1)]);
    }
}

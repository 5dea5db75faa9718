//! Device registration against the chat backend.
//!
//! Credentials are derived deterministically from the identity secret, so
//! every attempt presents the same material and the backend treats a
//! re-install as the same device re-claiming its account. The registrar
//! keeps at most one attempt in flight; concurrent callers queue behind it
//! and observe its outcome.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use satchel_shared::constants::{KDF_CONTEXT_AUTH_PASSWORD, KDF_CONTEXT_SIGNALING_KEY};
use satchel_shared::identity::Identity;

use crate::error::Result;
use crate::prefs::PreferenceStore;
use crate::transport::{DeviceCredentials, Transport};

/// Authentication material for `identity`, stable across calls.
pub fn device_credentials(identity: &Identity) -> DeviceCredentials {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    DeviceCredentials {
        address: identity.address(),
        password: hex::encode(identity.derive_secret(KDF_CONTEXT_AUTH_PASSWORD)),
        signaling_key: STANDARD.encode(identity.derive_secret(KDF_CONTEXT_SIGNALING_KEY)),
        registration_id: identity.registration_id(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationState {
    Unregistered,
    /// An attempt is in flight.
    Registering,
    Registered { since: DateTime<Utc> },
}

/// Coordinates device registration against the backend.
pub struct Registrar<T: Transport> {
    transport: Arc<T>,
    prefs: Arc<dyn PreferenceStore>,
    credentials: DeviceCredentials,
    state: Mutex<RegistrationState>,
    /// Serializes attempts; holders of this lock own the state transition.
    attempt: AsyncMutex<()>,
}

impl<T: Transport> Registrar<T> {
    pub fn new(
        transport: Arc<T>,
        prefs: Arc<dyn PreferenceStore>,
        credentials: DeviceCredentials,
    ) -> Self {
        Self {
            transport,
            prefs,
            credentials,
            state: Mutex::new(RegistrationState::Unregistered),
            attempt: AsyncMutex::new(()),
        }
    }

    /// Register unless this device already is, per the in-memory state or
    /// the persisted flag. At most one attempt runs at a time; concurrent
    /// callers wait for it instead of issuing duplicates.
    pub async fn ensure_registered(&self) -> Result<()> {
        let _attempt = self.attempt.lock().await;
        self.ensure_registered_locked().await
    }

    /// The connectivity-restored variant: register if needed, then re-claim
    /// the push token, which backends drop across reconnects. A failed
    /// token re-claim is logged, not fatal.
    pub async fn refresh_with_onboarding(&self) -> Result<()> {
        let _attempt = self.attempt.lock().await;
        self.ensure_registered_locked().await?;

        if let Some(token) = self.prefs.push_token()? {
            if let Err(e) = self.transport.register_push_token(&token).await {
                warn!(error = %e, "push token re-registration failed");
            }
        }
        Ok(())
    }

    /// Claim `token` with the backend and persist it for later re-claims.
    pub async fn set_push_token(&self, token: &str) -> Result<()> {
        self.transport.register_push_token(token).await?;
        self.prefs.set_push_token(Some(token))?;
        Ok(())
    }

    pub async fn clear_push_token(&self) -> Result<()> {
        self.transport.unregister_push_token().await?;
        self.prefs.set_push_token(None)?;
        Ok(())
    }

    pub fn state(&self) -> RegistrationState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: RegistrationState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn ensure_registered_locked(&self) -> Result<()> {
        if matches!(self.state(), RegistrationState::Registered { .. }) {
            return Ok(());
        }
        if self.prefs.is_registered()? {
            debug!("device registration found in preferences");
            self.set_state(RegistrationState::Registered { since: Utc::now() });
            return Ok(());
        }
        self.register().await
    }

    async fn register(&self) -> Result<()> {
        debug!(address = %self.credentials.address, "registering device with chat backend");
        self.set_state(RegistrationState::Registering);

        match self.transport.register(&self.credentials).await {
            Ok(receipt) => {
                // The flag only short-circuits future attempts; losing it
                // costs one redundant (idempotent) registration.
                if let Err(e) = self.prefs.set_registered(true) {
                    warn!(error = %e, "failed to persist registration flag");
                }
                self.set_state(RegistrationState::Registered {
                    since: receipt.registered_at,
                });
                info!(address = %receipt.address, "device registered");
                Ok(())
            }
            Err(e) => {
                self.set_state(RegistrationState::Unregistered);
                Err(e.into())
            }
        }
    }
}

//! Process-wide chat preferences.
//!
//! What the chat layer persists outside the message database: the "this
//! device finished registering with the backend" flag that gates the fast
//! path of [`crate::registration::Registrar`], and the current push token
//! so it can be re-claimed after a reconnect or restart. Production uses
//! [`FilePrefs`]; tests use [`MemoryPrefs`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ChatError, Result};

pub trait PreferenceStore: Send + Sync {
    fn is_registered(&self) -> Result<bool>;
    fn set_registered(&self, registered: bool) -> Result<()>;
    fn push_token(&self) -> Result<Option<String>>;
    fn set_push_token(&self, token: Option<&str>) -> Result<()>;
}

/// Volatile preference store.
#[derive(Default)]
pub struct MemoryPrefs {
    registered: AtomicBool,
    push_token: Mutex<Option<String>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPrefs {
    fn is_registered(&self) -> Result<bool> {
        Ok(self.registered.load(Ordering::SeqCst))
    }

    fn set_registered(&self, registered: bool) -> Result<()> {
        self.registered.store(registered, Ordering::SeqCst);
        Ok(())
    }

    fn push_token(&self) -> Result<Option<String>> {
        Ok(self
            .push_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn set_push_token(&self, token: Option<&str>) -> Result<()> {
        *self
            .push_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token.map(str::to_string);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrefState {
    registered_with_server: bool,
    #[serde(default)]
    push_token: Option<String>,
}

/// JSON-file-backed preference store. Every write is flushed to disk so the
/// state survives process restarts.
pub struct FilePrefs {
    path: PathBuf,
    state: Mutex<PrefState>,
}

impl FilePrefs {
    /// Open (or initialize) the preference file at `path`. A missing or
    /// unreadable file starts from defaults; a malformed one is logged and
    /// replaced on the next write.
    pub fn open(path: &Path) -> Result<Self> {
        let state = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed preference file, starting fresh");
                    PrefState::default()
                }
            },
            Err(_) => PrefState::default(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn flush(&self, state: &PrefState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ChatError::Prefs(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(state).map_err(|e| ChatError::Prefs(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| ChatError::Prefs(e.to_string()))
    }
}

impl PreferenceStore for FilePrefs {
    fn is_registered(&self) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registered_with_server)
    }

    fn set_registered(&self, registered: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.registered_with_server = registered;
        self.flush(&state)
    }

    fn push_token(&self) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_token
            .clone())
    }

    fn set_push_token(&self, token: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.push_token = token.map(str::to_string);
        self.flush(&state)
    }
}

use std::path::PathBuf;

use satchel_shared::constants::DEFAULT_CHAT_SERVER;

/// Configuration for building a chat session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Chat backend endpoint the transport connects to.
    pub server_url: String,
    /// Directory for the message database and the preference file. `None`
    /// means the platform default data directory.
    pub data_dir: Option<PathBuf>,
    /// User agent string presented to the backend.
    pub user_agent: String,
    /// BCP 47 language tag advertised in first-contact handshakes.
    pub language: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_CHAT_SERVER.to_string(),
            data_dir: None,
            user_agent: format!("satchel/{}", env!("CARGO_PKG_VERSION")),
            language: "en".to_string(),
        }
    }
}

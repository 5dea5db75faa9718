/// Default chat backend endpoint
pub const DEFAULT_CHAT_SERVER: &str = "https://chat.satchel.network";

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Remote-allocated group identifier size in bytes
pub const GROUP_ID_SIZE: usize = 16;

/// Gap between two messages, in minutes, after which a timestamp separator
/// message is inserted into the conversation
pub const TIME_SEPARATOR_GAP_MINUTES: i64 = 15;

/// Maximum serialized group avatar size in bytes (256 KiB)
pub const MAX_AVATAR_BYTES: usize = 262_144;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_DB_KEY: &str = "satchel-db-key-v1";
pub const KDF_CONTEXT_AUTH_PASSWORD: &str = "satchel-auth-password-v1";
pub const KDF_CONTEXT_SIGNALING_KEY: &str = "satchel-signaling-key-v1";
pub const KDF_CONTEXT_REGISTRATION_ID: &str = "satchel-registration-id-v1";

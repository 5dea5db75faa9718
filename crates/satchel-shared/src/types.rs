use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{GROUP_ID_SIZE, PUBKEY_SIZE};

// User identity = Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != PUBKEY_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    pub fn thread_id(&self) -> ThreadId {
        ThreadId(self.to_hex())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Group identity, allocated by the backend when the group is created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GroupId(pub [u8; 16]);

impl GroupId {
    /// Allocate a fresh random group id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != GROUP_ID_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn thread_id(&self) -> ThreadId {
        ThreadId(self.to_hex())
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Stable conversation identifier: the peer's address hex for 1:1 threads,
/// the group id hex for group threads. Immutable once a conversation exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Address> for ThreadId {
    fn from(address: &Address) -> Self {
        address.thread_id()
    }
}

impl From<&GroupId> for ThreadId {
    fn from(group_id: &GroupId) -> Self {
        group_id.thread_id()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_hex_round_trip() {
        let address = Address([7u8; 32]);
        let restored = Address::from_hex(&address.to_hex()).unwrap();
        assert_eq!(address, restored);
    }

    #[test]
    fn address_rejects_wrong_length() {
        assert!(Address::from_hex("deadbeef").is_err());
    }

    #[test]
    fn group_thread_ids_differ_from_user_thread_ids() {
        // 16-byte group ids and 32-byte addresses can never collide as hex.
        let group = GroupId::random();
        let address = Address([1u8; 32]);
        assert_ne!(group.thread_id(), address.thread_id());
        assert_eq!(group.thread_id().as_str().len(), 32);
        assert_eq!(address.thread_id().as_str().len(), 64);
    }
}

//! Symmetric hash ratchet.
//!
//! A [`ChainKey`] produces one [`MessageKey`] per step and replaces itself
//! with the next chain key. Both outputs come from HMAC under the current
//! chain key with distinct constants, so neither the previous chain key nor
//! earlier message keys can be recomputed from the new chain key.

use std::fmt;

use crate::{error::CryptoError, kdf::keyed_hash, key::SymmetricKey};

const MESSAGE_KEY_CONSTANT: &[u8] = &[0x01];
const CHAIN_KEY_CONSTANT: &[u8] = &[0x02];

/// One end of a sending or receiving chain.
#[derive(Clone, PartialEq, Eq)]
pub struct ChainKey {
    key: SymmetricKey,
    index: u32,
}

impl ChainKey {
    /// Start a chain at index 0.
    pub fn new(key: SymmetricKey) -> Self {
        Self { key, index: 0 }
    }

    /// Resume a chain at a known index (state import).
    pub fn from_parts(key: SymmetricKey, index: u32) -> Self {
        Self { key, index }
    }

    /// Index of the next message key this chain will produce.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Current chain key.
    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Produce the message key for [`Self::index`] and advance.
    ///
    /// # Errors
    ///
    /// `ChainExhausted` once the index would overflow.
    pub fn next_message_key(&mut self) -> Result<MessageKey, CryptoError> {
        let next_index = self.index.checked_add(1).ok_or(CryptoError::ChainExhausted(self.index))?;

        let message_key = keyed_hash(self.key.as_bytes(), MESSAGE_KEY_CONSTANT)?;
        let chain_key = keyed_hash(self.key.as_bytes(), CHAIN_KEY_CONSTANT)?;

        let produced = MessageKey { key: message_key, index: self.index };
        self.key = chain_key;
        self.index = next_index;
        Ok(produced)
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Single-use key for one message.
#[derive(Clone, PartialEq, Eq)]
pub struct MessageKey {
    key: SymmetricKey,
    index: u32,
}

impl MessageKey {
    /// Rebuild a cached message key.
    pub fn from_parts(key: SymmetricKey, index: u32) -> Self {
        Self { key, index }
    }

    /// Position of this key in its chain.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Key bytes.
    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_produces_distinct_keys() {
        let mut chain = ChainKey::new(SymmetricKey::from_bytes([5; 32]));
        let k0 = chain.next_message_key().unwrap();
        let k1 = chain.next_message_key().unwrap();

        assert_eq!(k0.index(), 0);
        assert_eq!(k1.index(), 1);
        assert_ne!(k0.key(), k1.key());
        assert_eq!(chain.index(), 2);
    }

    #[test]
    fn two_chains_from_same_key_agree() {
        let mut a = ChainKey::new(SymmetricKey::from_bytes([6; 32]));
        let mut b = ChainKey::new(SymmetricKey::from_bytes([6; 32]));
        for _ in 0..5 {
            assert_eq!(a.next_message_key().unwrap(), b.next_message_key().unwrap());
        }
    }

    #[test]
    fn chain_key_never_equals_message_key() {
        let mut chain = ChainKey::new(SymmetricKey::from_bytes([8; 32]));
        let mk = chain.next_message_key().unwrap();
        assert_ne!(mk.key(), chain.key());
    }

    #[test]
    fn exhausted_chain_errors() {
        let mut chain = ChainKey::from_parts(SymmetricKey::from_bytes([1; 32]), u32::MAX);
        assert_eq!(chain.next_message_key(), Err(CryptoError::ChainExhausted(u32::MAX)));
    }
}

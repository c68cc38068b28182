//! Error types for cryptographic primitives.

use thiserror::Error;

/// Errors from cryptographic primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD tag did not verify (wrong key, tampered ciphertext or aad)
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Sealed input is shorter than nonce plus tag
    #[error("sealed message too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// Key material of the wrong size
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length in bytes
        expected: usize,
        /// Supplied length in bytes
        actual: usize,
    },

    /// HKDF or HMAC rejected its parameters
    #[error("key derivation failed")]
    KeyDerivation,

    /// Encryption backend failure
    #[error("encryption failed")]
    Encryption,

    /// X25519 output was all zeros (small-order remote key)
    #[error("non-contributory Diffie-Hellman result")]
    WeakSharedSecret,

    /// Chain reached the maximum message index
    #[error("chain exhausted at index {0}")]
    ChainExhausted(u32),
}

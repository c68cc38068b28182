//! XChaCha20-Poly1305 authenticated encryption.
//!
//! Sealed output is `nonce || ciphertext || tag`. The 24-byte nonce is
//! supplied by the caller; XChaCha's extended nonce makes random nonces safe
//! even for keys that seal many messages (group epoch keys).

use chacha20poly1305::{
    Key, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead as _, Payload},
};

use crate::{error::CryptoError, key::SymmetricKey};

/// XChaCha20 nonce size in bytes.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// AEAD cipher bound to one key.
pub struct Aead {
    cipher: XChaCha20Poly1305,
}

impl Aead {
    /// Bind a cipher to `key`.
    pub fn new(key: &SymmetricKey) -> Self {
        Self { cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())) }
    }

    /// Seal `plaintext`, authenticating `aad`.
    ///
    /// Returns `nonce || ciphertext || tag`.
    pub fn encrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open output of [`Aead::encrypt`].
    ///
    /// # Errors
    ///
    /// - `CiphertextTooShort` if `sealed` cannot hold a nonce and a tag
    /// - `AuthenticationFailed` on any tag mismatch
    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

//! X25519 key agreement.

use std::fmt;

use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::{error::CryptoError, key::SymmetricKey};

/// X25519 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw public key bytes.
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy public key bytes from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: PUBLIC_KEY_SIZE, actual: bytes.len() }
        })?;
        Ok(Self(array))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Raw bytes, by value.
    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// An X25519 key pair.
///
/// The private scalar is generated from caller-supplied random bytes so the
/// whole key schedule stays reproducible under a seeded environment.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from 32 random bytes (clamped per RFC 7748).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// Public half.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Private scalar bytes, for state export.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Compute the shared secret with `remote`.
    ///
    /// # Errors
    ///
    /// `WeakSharedSecret` if `remote` is a small-order point and the output
    /// carries no contribution from our private key.
    pub fn diffie_hellman(&self, remote: &PublicKey) -> Result<SymmetricKey, CryptoError> {
        let shared = self.secret.diffie_hellman(&x25519_dalek::PublicKey::from(remote.0));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }
        Ok(SymmetricKey::from_bytes(shared.to_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_agrees() {
        let alice = KeyPair::from_secret_bytes([1; 32]);
        let bob = KeyPair::from_secret_bytes([2; 32]);

        let ab = alice.diffie_hellman(&bob.public()).unwrap();
        let ba = bob.diffie_hellman(&alice.public()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn secret_bytes_rebuild_same_pair() {
        let pair = KeyPair::from_secret_bytes([9; 32]);
        let rebuilt = KeyPair::from_secret_bytes(*pair.secret_bytes());
        assert_eq!(pair.public(), rebuilt.public());
    }

    #[test]
    fn small_order_point_rejected() {
        let pair = KeyPair::from_secret_bytes([3; 32]);
        let identity = PublicKey::from_bytes([0; 32]);
        assert_eq!(pair.diffie_hellman(&identity), Err(CryptoError::WeakSharedSecret));
    }
}

//! Fixed-size symmetric secrets.

use std::fmt;

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Size of every symmetric secret in bytes.
pub const KEY_SIZE: usize = 32;

/// A 32-byte secret, zeroized on drop.
///
/// Used for root keys, chain keys, message keys and group secrets. Equality
/// is constant-time and `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy key bytes from a slice.
    ///
    /// # Errors
    ///
    /// `InvalidKeyLength` unless the slice is exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: bytes.len() })?;
        Ok(Self(array))
    }

    /// The all-zero key.
    pub const fn zero() -> Self {
        Self([0u8; KEY_SIZE])
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert_eq!(
            SymmetricKey::from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 31 })
        );
        assert!(SymmetricKey::from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn debug_is_redacted() {
        let key = SymmetricKey::from_bytes([0x42; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "SymmetricKey(..)");
    }
}

//! Key derivation: HKDF for root/bootstrap keys, HMAC for keyed hashes,
//! SHA-256 for digests.
//!
//! Labels are domain separators. Changing any of them changes every derived
//! key, so they are part of the wire protocol.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    key::{KEY_SIZE, SymmetricKey},
};

type HmacSha256 = Hmac<Sha256>;

/// Domain separator for the DH ratchet root KDF.
pub const ROOT_KDF_INFO: &[u8] = b"securecomm/v1/ratchet-root";

/// Domain separator for bootstrapping a session from an agreed root key.
pub const BOOTSTRAP_KDF_INFO: &[u8] = b"securecomm/v1/bootstrap";

/// Root KDF: mix a DH output into the root key.
///
/// Returns `(new_root_key, chain_key)`.
pub fn derive_root(
    root_key: &SymmetricKey,
    dh_output: &SymmetricKey,
) -> Result<(SymmetricKey, SymmetricKey), CryptoError> {
    let okm = hkdf_expand::<{ 2 * KEY_SIZE }>(
        root_key.as_bytes(),
        dh_output.as_bytes(),
        ROOT_KDF_INFO,
    )?;
    Ok((split_key(&okm[..KEY_SIZE])?, split_key(&okm[KEY_SIZE..])?))
}

/// Derive the initial session state from an agreed root key.
///
/// Returns `(root_key, initiator_chain, responder_chain)`. The initiator
/// sends on the first chain, the responder on the second. `session_id` is
/// bound into the derivation so one root key cannot seed two sessions with
/// the same chains.
pub fn derive_bootstrap(
    root_key: &SymmetricKey,
    session_id: &[u8],
) -> Result<(SymmetricKey, SymmetricKey, SymmetricKey), CryptoError> {
    let mut info = Vec::with_capacity(BOOTSTRAP_KDF_INFO.len() + session_id.len());
    info.extend_from_slice(BOOTSTRAP_KDF_INFO);
    info.extend_from_slice(session_id);

    let okm = hkdf_expand::<{ 3 * KEY_SIZE }>(&[], root_key.as_bytes(), &info)?;
    Ok((
        split_key(&okm[..KEY_SIZE])?,
        split_key(&okm[KEY_SIZE..2 * KEY_SIZE])?,
        split_key(&okm[2 * KEY_SIZE..])?,
    ))
}

/// HMAC-SHA-256 of `data` under `key`.
pub fn keyed_hash(key: &[u8], data: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(data);
    let out: [u8; KEY_SIZE] = mac.finalize().into_bytes().into();
    Ok(SymmetricKey::from_bytes(out))
}

/// SHA-256 digest.
pub fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn hkdf_expand<const N: usize>(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; N]>, CryptoError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; N]);
    hkdf.expand(info, &mut okm[..]).map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

fn split_key(bytes: &[u8]) -> Result<SymmetricKey, CryptoError> {
    SymmetricKey::from_slice(bytes)
}

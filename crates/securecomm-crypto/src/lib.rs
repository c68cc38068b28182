//! Securecomm cryptographic primitives
//!
//! Cryptographic building blocks for the securecomm engine. Pure functions
//! with deterministic outputs: callers provide random bytes (nonces, key
//! seeds) so that every higher-level state machine can be replayed in tests.
//!
//! # Key Lifecycle
//!
//! Pairwise sessions and groups share one hierarchy shape. A long-lived
//! secret (ratchet root key, group epoch secret) feeds a KDF that produces
//! chain keys; a chain key produces one-time message keys; a message key
//! seals exactly one payload.
//!
//! ```text
//! Root Key ──HKDF(DH output)──► Root Key', Chain Key
//!                                        │
//!                                        ▼
//!                          HMAC chain ──► Message Keys
//!                                        │
//!                                        ▼
//!                         XChaCha20-Poly1305 ──► Ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys advance through HMAC; the previous chain key cannot be
//!   recomputed from the next one
//! - Message keys are zeroized on drop and never stored after use
//!
//! Authenticity:
//! - Every ciphertext carries a Poly1305 tag over payload and associated data
//! - A failed tag is reported as [`CryptoError::AuthenticationFailed`] and
//!   no plaintext is released
//!
//! Key agreement:
//! - X25519 with rejection of non-contributory (small-order) results

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod chain;
pub mod dh;
pub mod error;
pub mod kdf;
pub mod key;

pub use aead::{Aead, NONCE_SIZE, TAG_SIZE};
pub use chain::{ChainKey, MessageKey};
pub use dh::{KeyPair, PUBLIC_KEY_SIZE, PublicKey};
pub use error::CryptoError;
pub use key::{KEY_SIZE, SymmetricKey};

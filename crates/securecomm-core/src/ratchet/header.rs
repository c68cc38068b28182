//! Ratchet message header.
//!
//! ```text
//! ┌──────────────────┬──────────────────┬────────────────┬───────────┐
//! │ dh_public (32)   │ previous_counter │ message_number │ bootstrap │
//! │                  │ u32 BE           │ u32 BE         │ u8 (0/1)  │
//! └──────────────────┴──────────────────┴────────────────┴───────────┘
//! ```
//!
//! The header travels in clear in front of the sealed payload and is
//! authenticated as part of the AEAD associated data.

use securecomm_crypto::{PUBLIC_KEY_SIZE, PublicKey};

use crate::error::{Error, Result};

/// Encoded header size in bytes.
pub(crate) const HEADER_SIZE: usize = PUBLIC_KEY_SIZE + 4 + 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    /// Sender's current ratchet public key
    pub dh_public: PublicKey,
    /// Length of the sender's previous sending chain
    pub previous_counter: u32,
    /// Position in the current sending chain
    pub message_number: u32,
    /// Sent on the bootstrap chain, before the sender's first DH step
    pub bootstrap: bool,
}

impl Header {
    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..32].copy_from_slice(self.dh_public.as_bytes());
        out[32..36].copy_from_slice(&self.previous_counter.to_be_bytes());
        out[36..40].copy_from_slice(&self.message_number.to_be_bytes());
        out[40] = u8::from(self.bootstrap);
        out
    }

    /// Split a ratchet ciphertext into its header and sealed payload.
    pub(crate) fn decode(ciphertext: &[u8]) -> Result<(Self, &[u8])> {
        if ciphertext.len() < HEADER_SIZE {
            return Err(Error::malformed(
                "ratchet header",
                format!("{} bytes, need {HEADER_SIZE}", ciphertext.len()),
            ));
        }
        let (raw, sealed) = ciphertext.split_at(HEADER_SIZE);

        let dh_public = PublicKey::from_slice(&raw[..32])?;
        let previous_counter = u32::from_be_bytes([raw[32], raw[33], raw[34], raw[35]]);
        let message_number = u32::from_be_bytes([raw[36], raw[37], raw[38], raw[39]]);
        let bootstrap = match raw[40] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::malformed("ratchet header", format!("bootstrap flag {other}")));
            },
        };

        Ok((Self { dh_public, previous_counter, message_number, bootstrap }, sealed))
    }

    /// AEAD associated data: encoded header followed by the caller's aad.
    pub(crate) fn associated_data(&self, aad: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + aad.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(aad);
        out
    }
}

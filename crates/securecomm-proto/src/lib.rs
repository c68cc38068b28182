//! Wire format for the securecomm messaging engine.
//!
//! Every encrypted message travels as an [`Envelope`]: a fixed sequence of
//! big-endian integers and length-prefixed byte fields. The same record
//! carries both pairwise (ratchet) traffic and group traffic; the dispatcher
//! tells them apart by `session_id`.
//!
//! # Security
//!
//! Decoding never trusts a length prefix. Each declared length is checked
//! against the bytes that remain before anything is copied, the total size is
//! capped at [`Envelope::MAX_SIZE`], and trailing garbage is rejected so that
//! one logical envelope has exactly one encoding.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod errors;

pub use envelope::Envelope;
pub use errors::{ProtocolError, Result};

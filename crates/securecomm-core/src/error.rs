//! Error types for sessions, groups, transports and dispatch.
//!
//! Every variant belongs to one [`ErrorKind`]. Callers that only need to
//! know whether to fix their input, distrust the peer, fix their call
//! sequence or look something up again can match on [`Error::kind`].

use securecomm_crypto::CryptoError;
use securecomm_proto::ProtocolError;
use thiserror::Error;

use crate::mls::GroupId;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or truncated input
    Validation,
    /// Authentication failure, replayed or unavailable message key
    Crypto,
    /// Operation not valid in the current state
    State,
    /// Unknown group or member
    NotFound,
    /// Delivery channel failure
    Transport,
}

/// Errors from core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Envelope failed to decode or encode
    #[error("invalid envelope: {0}")]
    Envelope(#[from] ProtocolError),

    /// Some other input is malformed
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// What was being parsed
        what: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Primitive failure (tag mismatch, bad key, exhausted chain)
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Message key already consumed, or message older than the chain
    #[error("message {index} was already decrypted or its key was discarded")]
    Replay {
        /// Message number in its chain
        index: u32,
    },

    /// Decrypting would require skipping too many message keys
    #[error("message {index} would skip {skip} keys (max {max})")]
    TooManySkipped {
        /// Target message number
        index: u32,
        /// Keys that would have to be derived
        skip: u32,
        /// Configured limit
        max: u32,
    },

    /// Group ciphertext bound to an epoch whose secret is not held
    #[error("epoch {epoch} is not available (current epoch {current})")]
    EpochMismatch {
        /// Epoch named in the envelope
        epoch: u64,
        /// Group's current epoch
        current: u64,
    },

    /// Ratchet used before `initialize`
    #[error("{operation} called before initialize")]
    NotInitialized {
        /// Attempted operation
        operation: &'static str,
    },

    /// Operation not allowed in the current state
    #[error("invalid state for {operation}: {reason}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// What is wrong
        reason: String,
    },

    /// No initialized session with this device
    #[error("no session with device {0}")]
    NoSession(String),

    /// Group id not known to this manager
    #[error("group {0} not found")]
    GroupNotFound(GroupId),

    /// Member not part of the group
    #[error("member {member} not found in group {group}")]
    MemberNotFound {
        /// Group searched
        group: GroupId,
        /// Missing member
        member: String,
    },

    /// Delivery channel failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Envelope(_) | Self::Malformed { .. } => ErrorKind::Validation,
            Self::Crypto(_)
            | Self::Replay { .. }
            | Self::TooManySkipped { .. }
            | Self::EpochMismatch { .. } => ErrorKind::Crypto,
            Self::NotInitialized { .. } | Self::InvalidState { .. } | Self::NoSession(_) => {
                ErrorKind::State
            },
            Self::GroupNotFound(_) | Self::MemberNotFound { .. } => ErrorKind::NotFound,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed { what, reason: reason.into() }
    }

    pub(crate) fn invalid_state(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidState { operation, reason: reason.into() }
    }
}

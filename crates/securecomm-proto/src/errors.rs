//! Envelope decoding errors.

use thiserror::Error;

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Reasons an envelope can be rejected.
///
/// All of these are validation failures: the bytes on the wire do not
/// describe a well-formed envelope. None of them are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Input ended before a fixed-width field could be read.
    #[error("truncated envelope: needed {needed} bytes for {field}, {remaining} remaining")]
    Truncated {
        /// Field being read
        field: &'static str,
        /// Bytes the field requires
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// A length prefix points past the end of the input.
    #[error("length of {field} is {declared} but only {remaining} bytes remain")]
    LengthOverflow {
        /// Field whose prefix is inconsistent
        field: &'static str,
        /// Declared length
        declared: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Bytes left over after the last field.
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    /// Version field is not one this build understands.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    /// A device id field is not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Field that failed to decode
        field: &'static str,
    },

    /// Envelope exceeds [`crate::Envelope::MAX_SIZE`].
    #[error("envelope size {size} exceeds maximum {max}")]
    EnvelopeTooLarge {
        /// Encoded or declared size
        size: usize,
        /// Maximum allowed
        max: usize,
    },
}

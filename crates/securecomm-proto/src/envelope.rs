//! The envelope record and its canonical binary layout.
//!
//! # Layout
//!
//! ```text
//! ┌─────────┬──────────────┬───────────────┬──────────────────┬───────────┐
//! │ version │ session_id   │ message_index │ previous_counter │ timestamp │
//! │ u32     │ u32 len+data │ u32           │ u32              │ u64       │
//! ├─────────┴──────────────┼───────────────┴──────┬───────────┴───────────┤
//! │ sender_device_id       │ receiver_device_id   │ ciphertext            │
//! │ u32 len+utf8           │ u32 len+utf8         │ u32 len+data          │
//! ├────────────────────────┼──────────────────────┴───────────────────────┤
//! │ signature              │ associated_data                              │
//! │ u32 len+data           │ u32 len+data                                 │
//! └────────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. Empty fields encode as a zero length prefix.

use bytes::{Buf, BufMut};

use crate::errors::{ProtocolError, Result};

/// One encrypted message on the wire.
///
/// For pairwise traffic `session_id` identifies the ratchet session and
/// `message_index`/`previous_counter` mirror the ratchet header. For group
/// traffic `session_id` is the group id and `associated_data` carries the
/// group id and epoch the ciphertext is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    /// Wire format version
    pub version: u32,
    /// Ratchet session id or group id
    pub session_id: Vec<u8>,
    /// Message number within the sending chain
    pub message_index: u32,
    /// Length of the sender's previous sending chain
    pub previous_counter: u32,
    /// Milliseconds since the Unix epoch at the sender
    pub timestamp: u64,
    /// Device that produced the envelope
    pub sender_device_id: String,
    /// Intended recipient, empty for group traffic
    pub receiver_device_id: String,
    /// AEAD output
    pub ciphertext: Vec<u8>,
    /// Detached signature, empty when unsigned
    pub signature: Vec<u8>,
    /// Data authenticated alongside the ciphertext
    pub associated_data: Vec<u8>,
}

impl Envelope {
    /// Current wire format version.
    pub const VERSION: u32 = 1;

    /// Size of an envelope whose variable fields are all empty: three `u32`
    /// scalars, six `u32` length prefixes and the `u64` timestamp.
    pub const MIN_SIZE: usize = 4 * 9 + 8;

    /// Upper bound on an encoded envelope (16 MiB).
    pub const MAX_SIZE: usize = 16 * 1024 * 1024;

    /// Create an empty envelope stamped with the current version.
    pub fn new() -> Self {
        Self { version: Self::VERSION, ..Self::default() }
    }

    /// Size of this envelope once serialized.
    pub fn encoded_len(&self) -> usize {
        Self::MIN_SIZE
            + self.session_id.len()
            + self.sender_device_id.len()
            + self.receiver_device_id.len()
            + self.ciphertext.len()
            + self.signature.len()
            + self.associated_data.len()
    }

    /// Encode into the canonical layout.
    ///
    /// # Errors
    ///
    /// `EnvelopeTooLarge` if the encoding would exceed [`Self::MAX_SIZE`].
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let size = self.encoded_len();
        if size > Self::MAX_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge { size, max: Self::MAX_SIZE });
        }

        let mut out = Vec::with_capacity(size);
        out.put_u32(self.version);
        put_field(&mut out, &self.session_id);
        out.put_u32(self.message_index);
        out.put_u32(self.previous_counter);
        out.put_u64(self.timestamp);
        put_field(&mut out, self.sender_device_id.as_bytes());
        put_field(&mut out, self.receiver_device_id.as_bytes());
        put_field(&mut out, &self.ciphertext);
        put_field(&mut out, &self.signature);
        put_field(&mut out, &self.associated_data);

        debug_assert_eq!(out.len(), size);
        Ok(out)
    }

    /// Decode from the canonical layout.
    ///
    /// # Errors
    ///
    /// - `EnvelopeTooLarge` if the input exceeds [`Self::MAX_SIZE`]
    /// - `Truncated` if a fixed-width field is cut short
    /// - `LengthOverflow` if a length prefix exceeds the remaining input
    /// - `UnsupportedVersion` for any version other than [`Self::VERSION`]
    /// - `InvalidUtf8` if a device id is not UTF-8
    /// - `TrailingBytes` if input continues past `associated_data`
    pub fn deserialize(input: &[u8]) -> Result<Self> {
        if input.len() > Self::MAX_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge { size: input.len(), max: Self::MAX_SIZE });
        }

        let mut reader = Reader { buf: input };

        let version = reader.u32("version")?;
        if version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let session_id = reader.field("session_id")?.to_vec();
        let message_index = reader.u32("message_index")?;
        let previous_counter = reader.u32("previous_counter")?;
        let timestamp = reader.u64("timestamp")?;
        let sender_device_id = reader.string("sender_device_id")?;
        let receiver_device_id = reader.string("receiver_device_id")?;
        let ciphertext = reader.field("ciphertext")?.to_vec();
        let signature = reader.field("signature")?.to_vec();
        let associated_data = reader.field("associated_data")?.to_vec();

        if !reader.buf.is_empty() {
            return Err(ProtocolError::TrailingBytes(reader.buf.len()));
        }

        Ok(Self {
            version,
            session_id,
            message_index,
            previous_counter,
            timestamp,
            sender_device_id,
            receiver_device_id,
            ciphertext,
            signature,
            associated_data,
        })
    }

    /// True if this envelope addresses a specific device.
    pub fn is_addressed(&self) -> bool {
        !self.receiver_device_id.is_empty()
    }
}

fn put_field(out: &mut Vec<u8>, data: &[u8]) {
    // MAX_SIZE < u32::MAX, so the length always fits once the size check passed
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn ensure(&self, field: &'static str, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated { field, needed, remaining: self.buf.remaining() });
        }
        Ok(())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64())
    }

    fn field(&mut self, field: &'static str) -> Result<&'a [u8]> {
        let declared = self.u32(field)? as usize;
        if declared > self.buf.len() {
            return Err(ProtocolError::LengthOverflow {
                field,
                declared,
                remaining: self.buf.len(),
            });
        }
        let (data, rest) = self.buf.split_at(declared);
        self.buf = rest;
        Ok(data)
    }

    fn string(&mut self, field: &'static str) -> Result<String> {
        let data = self.field(field)?;
        String::from_utf8(data.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
    }
}

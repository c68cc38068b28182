//! Environment abstraction for time and randomness.
//!
//! Every random value in the engine (DH key seeds, AEAD nonces, group ids,
//! leaf secrets) and every timestamp flows through this trait. Production
//! code uses [`SystemEnv`]; tests substitute a seeded implementation to get
//! reproducible key schedules.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{RngCore, rngs::OsRng};

/// Source of wall-clock time and cryptographic randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;

    /// Fill `buffer` with random bytes.
    ///
    /// Implementations used outside tests must be cryptographically secure.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Produce a fixed-size random array.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.random_bytes(&mut out);
        out
    }
}

/// System clock and OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn unix_millis(&self) -> u64 {
        // A clock before 1970 reports zero rather than failing the send
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use super::Environment;

    /// Deterministic counter-based environment for unit tests.
    #[derive(Clone, Default)]
    pub(crate) struct CountingEnv {
        counter: Arc<AtomicU64>,
    }

    impl Environment for CountingEnv {
        fn unix_millis(&self) -> u64 {
            1_700_000_000_000
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for chunk in buffer.chunks_mut(8) {
                let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                let bytes = n.wrapping_mul(0x9E37_79B9_7F4A_7C15).to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }
}

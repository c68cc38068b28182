//! Deterministic simulation harness for securecomm testing.
//!
//! Seeded implementations of the core's [`Environment`] trait plus fixtures
//! shared by integration and model-based tests. Every key, nonce and group
//! id produced under a [`SimEnv`] is a pure function of its seed, so a
//! failing proptest case replays exactly.
//!
//! [`Environment`]: securecomm_core::Environment

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod logging;
pub mod sim_env;

pub use fixtures::{ROOT_KEY, ratchet_pair};
pub use logging::init_tracing;
pub use sim_env::SimEnv;

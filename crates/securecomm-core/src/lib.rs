//! Securecomm protocol core logic
//!
//! End-to-end encryption state machines and the dispatcher that connects
//! them to a delivery channel.
//!
//! # Architecture
//!
//! The cryptographic state machines ([`Ratchet`], [`MlsManager`]) are
//! synchronous and isolated from I/O. Time and randomness come from an
//! [`Environment`] supplied by the caller, so the same code runs under the
//! system clock and OS entropy in production and under a seeded simulation
//! in tests.
//!
//! The [`Dispatcher`] owns one [`Transport`], a table of per-device ratchet
//! sessions and the group manager. It serializes all table access behind a
//! single lock and never holds that lock while running caller code
//! (transport sinks, inbound callbacks).
//!
//! # Components
//!
//! - [`ratchet`]: Pairwise Double-Ratchet sessions
//! - [`mls`]: Epoch-keyed group encryption
//! - [`transport`]: Delivery channel variants (in-memory, WebSocket, platform bridge)
//! - [`dispatcher`]: Session directory and message routing
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`error`]: Error taxonomy

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod dispatcher;
pub mod env;
pub mod error;
pub mod mls;
pub mod ratchet;
pub mod transport;

mod sync;

pub use dispatcher::{Dispatcher, DispatcherConfig, InboundCallback, InboundMessage};
pub use env::{Environment, SystemEnv};
pub use error::{Error, ErrorKind, Result};
pub use mls::{GroupId, MlsConfig, MlsManager};
pub use ratchet::{Ratchet, RatchetConfig, Role};
pub use securecomm_proto::Envelope;
pub use transport::{MessageHandler, Transport};

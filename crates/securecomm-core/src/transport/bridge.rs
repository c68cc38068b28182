//! Platform bridge transport.
//!
//! For hosts that own the actual delivery channel (mesh radio, SMS gateway,
//! a native socket stack). Outbound payloads go to a sink the host supplies;
//! the host pushes inbound payloads through a [`BridgeHandle`].

use std::sync::{Arc, Weak};

use bytes::Bytes;

use super::{MessageHandler, inbox::Inbox};
use crate::error::{Error, Result};

/// Host-supplied outbound sink. Must not block.
pub type OutboundSink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Transport whose I/O is performed by the host platform.
pub struct BridgeTransport {
    sink: OutboundSink,
    inbox: Arc<Inbox>,
}

/// Host-side handle for injecting inbound payloads.
#[derive(Clone)]
pub struct BridgeHandle {
    inbox: Weak<Inbox>,
}

impl BridgeTransport {
    /// Create a bridge around `sink` and the handle that feeds it.
    pub fn new(sink: OutboundSink) -> (Self, BridgeHandle) {
        let inbox = Arc::new(Inbox::default());
        let handle = BridgeHandle { inbox: Arc::downgrade(&inbox) };
        (Self { sink, inbox }, handle)
    }

    pub(crate) fn start(&self) -> Result<()> {
        self.inbox.start("securecomm-bridge")
    }

    pub(crate) fn stop(&self) {
        self.inbox.stop();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inbox.is_running()
    }

    pub(crate) fn send(&self, payload: Bytes) -> Result<()> {
        if !self.inbox.is_running() {
            return Err(Error::Transport("bridge not started".into()));
        }
        (self.sink)(payload);
        Ok(())
    }

    pub(crate) fn set_on_message(&self, handler: MessageHandler) {
        self.inbox.set_handler(handler);
    }
}

impl BridgeHandle {
    /// Queue an inbound payload for the bridge's message handler.
    ///
    /// # Errors
    ///
    /// `Transport` if the bridge was dropped or is not running.
    pub fn deliver(&self, payload: impl Into<Bytes>) -> Result<()> {
        let inbox =
            self.inbox.upgrade().ok_or_else(|| Error::Transport("bridge was dropped".into()))?;
        inbox.deliver(payload.into())
    }
}

//! In-process transport.
//!
//! An [`InMemoryHub`] stands for a shared medium. Every endpoint taken from
//! the hub receives whatever any other started endpoint sends, each on its
//! own delivery thread.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use super::{MessageHandler, inbox::Inbox};
use crate::{
    error::{Error, Result},
    sync::lock,
};

/// Shared in-process medium.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    endpoints: Arc<Mutex<Vec<Weak<Inbox>>>>,
}

impl InMemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint.
    pub fn endpoint(&self) -> InMemoryTransport {
        let inbox = Arc::new(Inbox::default());
        lock(&self.endpoints).push(Arc::downgrade(&inbox));
        InMemoryTransport { hub: self.clone(), inbox }
    }

    fn peers_of(&self, sender: &Arc<Inbox>) -> Vec<Arc<Inbox>> {
        let mut endpoints = lock(&self.endpoints);
        endpoints.retain(|weak| weak.strong_count() > 0);
        endpoints
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|peer| !Arc::ptr_eq(peer, sender))
            .collect()
    }
}

/// One endpoint on an [`InMemoryHub`].
pub struct InMemoryTransport {
    hub: InMemoryHub,
    inbox: Arc<Inbox>,
}

impl InMemoryTransport {
    pub(crate) fn start(&self) -> Result<()> {
        self.inbox.start("securecomm-memory")
    }

    pub(crate) fn stop(&self) {
        self.inbox.stop();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inbox.is_running()
    }

    /// Enqueue `payload` for every other started endpoint.
    pub(crate) fn send(&self, payload: Bytes) -> Result<()> {
        if !self.inbox.is_running() {
            return Err(Error::Transport("transport not started".into()));
        }

        for peer in self.hub.peers_of(&self.inbox) {
            if peer.is_running() {
                // A peer stopping concurrently just misses the payload
                let _ = peer.deliver(payload.clone());
            }
        }
        Ok(())
    }

    pub(crate) fn set_on_message(&self, handler: MessageHandler) {
        self.inbox.set_handler(handler);
    }
}

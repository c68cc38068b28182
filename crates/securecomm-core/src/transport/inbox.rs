//! Inbound delivery worker shared by the in-memory and bridge transports.
//!
//! Payloads are queued on an unbounded channel and handed to the installed
//! handler on a dedicated thread, so the enqueuing side never runs handler
//! code.

use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::MessageHandler;
use crate::{
    error::{Error, Result},
    sync::lock,
};

pub(crate) type HandlerSlot = Arc<Mutex<Option<MessageHandler>>>;

/// Hand `payload` to the handler in `slot`, if any. The slot lock is released
/// before the handler runs.
pub(crate) fn dispatch(slot: &HandlerSlot, payload: Bytes) {
    let handler = lock(slot).clone();
    match handler {
        Some(handler) => handler(payload),
        None => tracing::debug!(len = payload.len(), "no message handler installed, dropping"),
    }
}

#[derive(Default)]
pub(crate) struct Inbox {
    handler: HandlerSlot,
    queue: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inbox {
    pub(crate) fn set_handler(&self, handler: MessageHandler) {
        *lock(&self.handler) = Some(handler);
    }

    pub(crate) fn is_running(&self) -> bool {
        lock(&self.queue).is_some()
    }

    /// Spawn the delivery thread. Idempotent.
    pub(crate) fn start(&self, name: &str) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let slot = Arc::clone(&self.handler);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(payload) = rx.blocking_recv() {
                    dispatch(&slot, payload);
                }
            })
            .map_err(|e| Error::Transport(format!("failed to spawn {name}: {e}")))?;

        *lock(&self.queue) = Some(tx);
        *worker = Some(handle);
        Ok(())
    }

    /// Queue `payload` for the handler.
    pub(crate) fn deliver(&self, payload: Bytes) -> Result<()> {
        let queue = lock(&self.queue);
        let tx = queue.as_ref().ok_or_else(|| Error::Transport("transport not started".into()))?;
        tx.send(payload).map_err(|_| Error::Transport("delivery worker exited".into()))
    }

    /// Close the queue and join the worker. Payloads still queued may be
    /// dropped. Idempotent.
    pub(crate) fn stop(&self) {
        // Dropping the sender ends the worker's receive loop
        lock(&self.queue).take();
        let handle = lock(&self.worker).take();

        if let Some(handle) = handle {
            // A handler that stops its own transport cannot join itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("delivery worker panicked");
            }
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.stop();
    }
}

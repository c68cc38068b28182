//! Delivery channels for serialized envelopes.
//!
//! A transport moves opaque byte payloads. It knows nothing about sessions,
//! groups or encryption. The set of backends is closed:
//!
//! - [`InMemoryTransport`]: endpoints of an in-process [`InMemoryHub`]
//! - [`WebSocketTransport`]: one WebSocket client connection
//! - [`BridgeTransport`]: I/O performed by the host platform
//!
//! # Concurrency
//!
//! Every backend delivers inbound payloads on its own worker thread.
//! [`Transport::send`] never blocks on the network; it queues the payload or
//! hands it to the host. [`Transport::stop`] unblocks and joins the worker;
//! payloads still in flight at that point may be lost.

mod bridge;
mod inbox;
mod memory;
mod websocket;

use std::sync::Arc;

use bytes::Bytes;

pub use self::{
    bridge::{BridgeHandle, BridgeTransport, OutboundSink},
    memory::{InMemoryHub, InMemoryTransport},
    websocket::{WebSocketConfig, WebSocketTransport},
};
use crate::error::Result;

/// Callback receiving each inbound payload, invoked on the worker thread.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A delivery channel, selected at construction.
pub enum Transport {
    /// In-process hub endpoint
    InMemory(InMemoryTransport),
    /// WebSocket client
    WebSocket(WebSocketTransport),
    /// Host-platform bridge
    PlatformBridge(BridgeTransport),
}

impl Transport {
    /// Start the worker. Idempotent.
    pub fn start(&self) -> Result<()> {
        let result = match self {
            Self::InMemory(t) => t.start(),
            Self::WebSocket(t) => t.start(),
            Self::PlatformBridge(t) => t.start(),
        };
        if result.is_ok() {
            tracing::info!(transport = self.kind(), "transport started");
        }
        result
    }

    /// Stop and join the worker. Idempotent.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        match self {
            Self::InMemory(t) => t.stop(),
            Self::WebSocket(t) => t.stop(),
            Self::PlatformBridge(t) => t.stop(),
        }
        tracing::info!(transport = self.kind(), "transport stopped");
    }

    /// True between [`Self::start`] and [`Self::stop`].
    pub fn is_running(&self) -> bool {
        match self {
            Self::InMemory(t) => t.is_running(),
            Self::WebSocket(t) => t.is_running(),
            Self::PlatformBridge(t) => t.is_running(),
        }
    }

    /// Queue `payload` for delivery.
    ///
    /// # Errors
    ///
    /// `Transport` if the transport is not running.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        match self {
            Self::InMemory(t) => t.send(payload),
            Self::WebSocket(t) => t.send(payload),
            Self::PlatformBridge(t) => t.send(payload),
        }
    }

    /// Install the handler for inbound payloads, replacing any previous one.
    pub fn set_on_message(&self, handler: MessageHandler) {
        match self {
            Self::InMemory(t) => t.set_on_message(handler),
            Self::WebSocket(t) => t.set_on_message(handler),
            Self::PlatformBridge(t) => t.set_on_message(handler),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::InMemory(_) => "in-memory",
            Self::WebSocket(_) => "websocket",
            Self::PlatformBridge(_) => "platform-bridge",
        }
    }
}

impl From<InMemoryTransport> for Transport {
    fn from(transport: InMemoryTransport) -> Self {
        Self::InMemory(transport)
    }
}

impl From<WebSocketTransport> for Transport {
    fn from(transport: WebSocketTransport) -> Self {
        Self::WebSocket(transport)
    }
}

impl From<BridgeTransport> for Transport {
    fn from(transport: BridgeTransport) -> Self {
        Self::PlatformBridge(transport)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Mutex, mpsc},
        time::Duration,
    };

    use super::*;
    use crate::{error::Error, sync::lock};

    fn collector() -> (MessageHandler, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: MessageHandler = Arc::new(move |payload: Bytes| {
            let _ = lock(&tx).send(payload);
        });
        (handler, rx)
    }

    #[test]
    fn hub_fans_out_to_other_endpoints() {
        let hub = InMemoryHub::new();
        let a = Transport::from(hub.endpoint());
        let b = Transport::from(hub.endpoint());
        let c = Transport::from(hub.endpoint());

        let (handler_a, rx_a) = collector();
        let (handler_b, rx_b) = collector();
        let (handler_c, rx_c) = collector();
        a.set_on_message(handler_a);
        b.set_on_message(handler_b);
        c.set_on_message(handler_c);
        for t in [&a, &b, &c] {
            t.start().unwrap();
        }

        a.send(Bytes::from_static(b"hello")).unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(&rx_b.recv_timeout(timeout).unwrap()[..], b"hello");
        assert_eq!(&rx_c.recv_timeout(timeout).unwrap()[..], b"hello");
        assert!(rx_a.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn stopped_endpoint_receives_nothing() {
        let hub = InMemoryHub::new();
        let a = Transport::from(hub.endpoint());
        let b = Transport::from(hub.endpoint());
        let (handler, rx) = collector();
        b.set_on_message(handler);

        a.start().unwrap();
        b.start().unwrap();
        b.stop();
        a.send(Bytes::from_static(b"lost")).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn send_on_stopped_transport_fails() {
        let hub = InMemoryHub::new();
        let a = Transport::from(hub.endpoint());
        assert!(matches!(a.send(Bytes::new()), Err(Error::Transport(_))));
    }

    #[test]
    fn bridge_routes_both_directions() {
        let (sink_tx, sink_rx) = mpsc::channel();
        let sink_tx = Mutex::new(sink_tx);
        let (bridge, handle) = BridgeTransport::new(Arc::new(move |payload: Bytes| {
            let _ = lock(&sink_tx).send(payload);
        }));
        let transport = Transport::from(bridge);
        let (handler, inbound) = collector();
        transport.set_on_message(handler);
        transport.start().unwrap();

        transport.send(Bytes::from_static(b"out")).unwrap();
        handle.deliver(b"in".to_vec()).unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(&sink_rx.recv_timeout(timeout).unwrap()[..], b"out");
        assert_eq!(&inbound.recv_timeout(timeout).unwrap()[..], b"in");

        transport.stop();
        assert!(handle.deliver(b"late".to_vec()).is_err());
    }
}

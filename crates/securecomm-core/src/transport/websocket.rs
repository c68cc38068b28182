//! WebSocket client transport.
//!
//! Runs a current-thread tokio runtime on a dedicated worker thread. Every
//! payload travels as one binary frame in either direction; text, ping and
//! pong frames are ignored. The connection is not re-established once it
//! closes; callers restart the transport.

use std::{
    sync::Mutex,
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{
    MessageHandler,
    inbox::{HandlerSlot, dispatch},
};
use crate::{
    error::{Error, Result},
    sync::lock,
};

/// WebSocket endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Server URL, `ws://` or `wss://` (TLS through rustls with the webpki roots)
    pub url: String,
    /// Limit on the opening handshake
    pub connect_timeout: Duration,
}

impl WebSocketConfig {
    /// Settings for `url` with the default timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), connect_timeout: Duration::from_secs(10) }
    }
}

struct Running {
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

/// Transport over a single WebSocket client connection.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    handler: HandlerSlot,
    running: Mutex<Option<Running>>,
}

impl WebSocketTransport {
    /// Create a stopped transport for `config`.
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config, handler: HandlerSlot::default(), running: Mutex::new(None) }
    }

    /// Spawn the connection worker. Payloads sent before the handshake
    /// completes are queued.
    pub(crate) fn start(&self) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let config = self.config.clone();
        let handler = HandlerSlot::clone(&self.handler);

        let worker = thread::Builder::new()
            .name("securecomm-websocket".to_string())
            .spawn(move || run_worker(config, outbound_rx, shutdown_rx, handler))
            .map_err(|e| Error::Transport(format!("failed to spawn websocket worker: {e}")))?;

        *running = Some(Running { outbound, shutdown, worker });
        Ok(())
    }

    /// Signal shutdown and join the worker. Idempotent.
    pub(crate) fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };

        // The worker may already have exited and dropped the receiver
        let _ = running.shutdown.send(());
        drop(running.outbound);

        if running.worker.thread().id() == thread::current().id() {
            return;
        }
        if running.worker.join().is_err() {
            tracing::warn!("websocket worker panicked");
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub(crate) fn send(&self, payload: Bytes) -> Result<()> {
        let running = lock(&self.running);
        let running =
            running.as_ref().ok_or_else(|| Error::Transport("websocket not started".into()))?;
        running
            .outbound
            .send(payload)
            .map_err(|_| Error::Transport("websocket connection closed".into()))
    }

    pub(crate) fn set_on_message(&self, handler: MessageHandler) {
        *lock(&self.handler) = Some(handler);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    config: WebSocketConfig,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: oneshot::Receiver<()>,
    handler: HandlerSlot,
) {
    install_crypto_provider();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build websocket runtime");
            return;
        },
    };

    runtime.block_on(async move {
        tokio::select! {
            _ = shutdown => {
                tracing::debug!(url = %config.url, "websocket shutdown requested");
            },
            result = run_connection(&config, outbound, &handler) => match result {
                Ok(()) => tracing::info!(url = %config.url, "websocket closed"),
                Err(e) => tracing::warn!(url = %config.url, error = %e, "websocket failed"),
            },
        }
    });
}

/// Select ring as the process-wide TLS provider for `wss://` handshakes.
/// Another provider installed first stays in place.
fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("tls crypto provider already installed");
    }
}

async fn run_connection(
    config: &WebSocketConfig,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    handler: &HandlerSlot,
) -> Result<()> {
    let (stream, _) = tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| Error::Transport(format!("connect to {} timed out", config.url)))?
        .map_err(|e| Error::Transport(e.to_string()))?;
    tracing::info!(url = %config.url, "websocket connected");

    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(payload) => sink
                    .send(Message::Binary(payload.to_vec()))
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?,
                None => {
                    let _ = sink.close().await;
                    return Ok(());
                },
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Binary(data))) => dispatch(handler, Bytes::from(data)),
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {},
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_before_start_fails() {
        let transport = WebSocketTransport::new(WebSocketConfig::new("ws://127.0.0.1:9"));
        assert!(matches!(transport.send(Bytes::from_static(b"x")), Err(Error::Transport(_))));
        assert!(!transport.is_running());
    }

    #[test]
    fn secure_urls_reach_the_network() {
        install_crypto_provider();
        let mut config = WebSocketConfig::new("wss://127.0.0.1:9/socket");
        config.connect_timeout = Duration::from_secs(2);
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();

        let err = runtime.block_on(run_connection(&config, rx, &HandlerSlot::default())).unwrap_err();
        // Refused or timed out, never rejected for the scheme
        let Error::Transport(message) = &err else { panic!("unexpected error {err}") };
        assert!(!message.contains("TLS support not compiled"), "{message}");
        assert!(!message.contains("URL error"), "{message}");
    }

    #[test]
    fn stop_joins_worker_even_without_server() {
        let mut config = WebSocketConfig::new("ws://127.0.0.1:9");
        config.connect_timeout = Duration::from_millis(200);
        let transport = WebSocketTransport::new(config);

        transport.start().unwrap();
        transport.start().unwrap();
        assert!(transport.is_running());
        transport.send(Bytes::from_static(b"queued")).ok();

        transport.stop();
        transport.stop();
        assert!(!transport.is_running());
    }
}

//! Session directory and message router.
//!
//! A [`Dispatcher`] owns one [`Transport`], a table of pairwise ratchet
//! sessions keyed by remote device id, and the group manager. Outbound
//! messages are encrypted under the table lock and handed to the transport
//! after the lock is released. Inbound payloads arrive on the transport's
//! worker thread, are decoded and decrypted under the lock, and are
//! published to subscribers and the inbound callback after it is released.
//!
//! Inbound traffic never produces an error for the caller: anything that
//! fails to decode, is not addressed to this device, or fails to decrypt is
//! logged at `debug` and dropped.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use bytes::Bytes;
use securecomm_crypto::{SymmetricKey, kdf::digest};
use securecomm_proto::Envelope;
use tokio::sync::mpsc;

use crate::{
    env::Environment,
    error::{Error, Result},
    mls::{GroupId, MlsConfig, MlsManager},
    ratchet::{Ratchet, RatchetConfig, Role},
    sync::lock,
    transport::{MessageHandler, Transport},
};

const SESSION_ID_LABEL: &[u8] = b"securecomm/v1/session";

/// Dispatcher configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Limits applied to every pairwise session
    pub ratchet: RatchetConfig,
    /// Group manager settings
    pub mls: MlsConfig,
}

/// A successfully decrypted inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Device that sent the envelope
    pub sender_device_id: String,
    /// Group the message was sent to, `None` for pairwise traffic
    pub group_id: Option<GroupId>,
    /// Recovered plaintext
    pub plaintext: Vec<u8>,
    /// Envelope as received
    pub envelope: Envelope,
}

/// Callback invoked for every decrypted inbound message.
///
/// Runs on the transport worker thread with no dispatcher lock held; it may
/// call back into the dispatcher.
pub type InboundCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Session id both ends of a device pair derive independently.
pub fn session_id_for(a: &str, b: &str) -> [u8; 16] {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut input = Vec::with_capacity(SESSION_ID_LABEL.len() + 8 + low.len() + high.len());
    input.extend_from_slice(SESSION_ID_LABEL);
    for id in [low, high] {
        input.extend_from_slice(&(id.len() as u32).to_be_bytes());
        input.extend_from_slice(id.as_bytes());
    }

    let hash = digest(&input);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[..16]);
    out
}

/// Role of `local` in its session with `remote`: the lexicographically
/// smaller device id initiates.
fn role_for(local: &str, remote: &str) -> Result<Role> {
    match local.cmp(remote) {
        std::cmp::Ordering::Less => Ok(Role::Initiator),
        std::cmp::Ordering::Greater => Ok(Role::Responder),
        std::cmp::Ordering::Equal => {
            Err(Error::invalid_state("create_session_with", "remote device is the local device"))
        },
    }
}

struct SessionState<E: Environment> {
    ratchet: Ratchet<E>,
    initialized: bool,
}

struct DispatcherState<E: Environment> {
    device_id: Option<String>,
    sessions: HashMap<String, SessionState<E>>,
    mls: MlsManager<E>,
    on_inbound: Option<InboundCallback>,
    subscribers: Vec<mpsc::UnboundedSender<InboundMessage>>,
}

impl<E: Environment> DispatcherState<E> {
    fn local_id(&self, operation: &'static str) -> Result<String> {
        self.device_id
            .clone()
            .ok_or_else(|| Error::invalid_state(operation, "no local device registered"))
    }

    /// Decrypt an envelope addressed to `local`.
    fn open(&mut self, local: &str, envelope: &Envelope) -> Result<(Option<GroupId>, Vec<u8>)> {
        let group = GroupId::from_slice(&envelope.session_id)
            .filter(|g| self.mls.group_epoch(*g).is_some_and(|epoch| epoch > 0));
        if let Some(group) = group {
            let plaintext = self.mls.decrypt_group_message(group, local, envelope)?;
            return Ok((Some(group), plaintext));
        }

        match self.sessions.get_mut(&envelope.sender_device_id) {
            Some(session) if session.initialized => {
                Ok((None, session.ratchet.decrypt_envelope(envelope)?))
            },
            _ => Err(Error::NoSession(envelope.sender_device_id.clone())),
        }
    }
}

struct Shared<E: Environment> {
    transport: Transport,
    env: E,
    config: DispatcherConfig,
    state: Mutex<DispatcherState<E>>,
}

impl<E: Environment> Shared<E> {
    fn on_raw_message(&self, bytes: &[u8]) {
        let envelope = match Envelope::deserialize(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, len = bytes.len(), "dropping undecodable payload");
                return;
            },
        };

        let (message, callback, subscribers) = {
            let mut state = lock(&self.state);
            let Some(local) = state.device_id.clone() else {
                tracing::debug!("no local device registered, dropping inbound envelope");
                return;
            };
            if envelope.sender_device_id == local {
                return;
            }
            if envelope.is_addressed() && envelope.receiver_device_id != local {
                tracing::debug!(receiver = %envelope.receiver_device_id, "envelope for another device");
                return;
            }

            let (group_id, plaintext) = match state.open(&local, &envelope) {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::debug!(
                        sender = %envelope.sender_device_id,
                        kind = ?e.kind(),
                        error = %e,
                        "dropping inbound envelope"
                    );
                    return;
                },
            };

            state.subscribers.retain(|tx| !tx.is_closed());
            let message = InboundMessage {
                sender_device_id: envelope.sender_device_id.clone(),
                group_id,
                plaintext,
                envelope,
            };
            (message, state.on_inbound.clone(), state.subscribers.clone())
        };

        if let Some(callback) = callback {
            callback(&message);
        }
        for tx in subscribers {
            // A receiver dropped since the snapshot is pruned on the next message
            let _ = tx.send(message.clone());
        }
    }
}

/// Routes encrypted envelopes between local sessions/groups and a transport.
///
/// Cheap to share across threads by reference; every method takes `&self`.
/// Dropping the dispatcher stops its transport.
pub struct Dispatcher<E: Environment> {
    shared: Arc<Shared<E>>,
}

impl<E: Environment> Dispatcher<E> {
    /// Build a dispatcher over `transport` and install its inbound handler.
    ///
    /// The transport is not started; call [`Self::start`].
    pub fn new(transport: Transport, env: E, config: DispatcherConfig) -> Self {
        let state = DispatcherState {
            device_id: None,
            sessions: HashMap::new(),
            mls: MlsManager::new(env.clone(), config.mls),
            on_inbound: None,
            subscribers: Vec::new(),
        };
        let shared = Arc::new(Shared { transport, env, config, state: Mutex::new(state) });

        let weak: Weak<Shared<E>> = Arc::downgrade(&shared);
        let handler: MessageHandler = Arc::new(move |payload: Bytes| {
            if let Some(shared) = weak.upgrade() {
                shared.on_raw_message(&payload);
            }
        });
        shared.transport.set_on_message(handler);

        Self { shared }
    }

    /// Start the transport.
    pub fn start(&self) -> Result<()> {
        self.shared.transport.start()
    }

    /// Stop the transport and join its worker. Idempotent.
    pub fn stop(&self) {
        self.shared.transport.stop();
    }

    /// Set the local device identity.
    pub fn register_device(&self, device_id: &str) {
        lock(&self.shared.state).device_id = Some(device_id.to_string());
        tracing::info!(device_id, "device registered");
    }

    /// Local device identity, if registered.
    pub fn device_id(&self) -> Option<String> {
        lock(&self.shared.state).device_id.clone()
    }

    /// Create (or replace) the session with `remote` from an agreed root key.
    ///
    /// Both devices must call this with the same 32-byte `root_key`. The
    /// session id and each side's role are derived from the two device ids,
    /// so no further coordination is needed.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if no device is registered or `remote` is the local
    ///   device
    /// - `Malformed` if `root_key` is not 32 bytes
    pub fn create_session_with(&self, remote: &str, root_key: &[u8]) -> Result<()> {
        let root_key = SymmetricKey::from_slice(root_key)
            .map_err(|e| Error::malformed("root key", e.to_string()))?;

        let mut state = lock(&self.shared.state);
        let local = state.local_id("create_session_with")?;
        let role = role_for(&local, remote)?;

        let mut ratchet = Ratchet::new(self.shared.env.clone(), self.shared.config.ratchet);
        ratchet.initialize(&root_key, &session_id_for(&local, remote), role)?;
        state.sessions.insert(remote.to_string(), SessionState { ratchet, initialized: true });

        tracing::info!(remote, ?role, "session created");
        Ok(())
    }

    /// True if an initialized session with `remote` exists.
    pub fn has_session(&self, remote: &str) -> bool {
        lock(&self.shared.state).sessions.get(remote).is_some_and(|s| s.initialized)
    }

    /// Encrypt `plaintext` for `remote` and send it.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if no device is registered
    /// - `NoSession` if there is no initialized session with `remote`
    /// - `Transport` if the transport is not running
    pub fn send_message_to_device(&self, remote: &str, plaintext: &[u8]) -> Result<()> {
        let bytes = {
            let mut state = lock(&self.shared.state);
            let local = state.local_id("send_message_to_device")?;
            let session = state
                .sessions
                .get_mut(remote)
                .filter(|s| s.initialized)
                .ok_or_else(|| Error::NoSession(remote.to_string()))?;
            session.ratchet.encrypt_envelope(plaintext, &local, remote)?.serialize()?
        };
        self.shared.transport.send(Bytes::from(bytes))
    }

    /// Encrypt `plaintext` to `group` as member `sender` and send it.
    ///
    /// The envelope's sender is the local device id when one is registered.
    pub fn send_group_message(&self, group: GroupId, sender: &str, plaintext: &[u8]) -> Result<()> {
        let bytes = {
            let state = lock(&self.shared.state);
            let mut envelope = state.mls.encrypt_group_message(group, sender, plaintext)?;
            if let Some(local) = &state.device_id {
                envelope.sender_device_id.clone_from(local);
            }
            envelope.serialize()?
        };
        self.shared.transport.send(Bytes::from(bytes))
    }

    /// Create a group.
    pub fn create_group(&self, name: &str) -> GroupId {
        lock(&self.shared.state).mls.create_group(name)
    }

    /// Add `member` to `group`. Returns the new epoch.
    pub fn add_group_member(&self, group: GroupId, member: &str) -> Result<u64> {
        lock(&self.shared.state).mls.add_member(group, member)
    }

    /// Remove `member` from `group`. Returns the new epoch.
    pub fn remove_group_member(&self, group: GroupId, member: &str) -> Result<u64> {
        lock(&self.shared.state).mls.remove_member(group, member)
    }

    /// Current epoch of `group`.
    pub fn group_epoch(&self, group: GroupId) -> Option<u64> {
        lock(&self.shared.state).mls.group_epoch(group)
    }

    /// Serialize `group` for installation on another device.
    pub fn export_group(&self, group: GroupId) -> Result<Vec<u8>> {
        lock(&self.shared.state).mls.export_group(group)
    }

    /// Install a group exported by another device.
    pub fn import_group(&self, blob: &[u8]) -> Result<GroupId> {
        lock(&self.shared.state).mls.import_group(blob)
    }

    /// Install the callback for decrypted inbound messages, replacing any
    /// previous one.
    pub fn set_on_inbound(&self, callback: InboundCallback) {
        lock(&self.shared.state).on_inbound = Some(callback);
    }

    /// Open a channel receiving every decrypted inbound message.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.state).subscribers.push(tx);
        rx
    }

    /// Process one raw payload as if it arrived from the transport.
    pub fn on_raw_message(&self, bytes: &[u8]) {
        self.shared.on_raw_message(bytes);
    }
}

impl<E: Environment> Drop for Dispatcher<E> {
    fn drop(&mut self) {
        self.shared.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        ErrorKind,
        env::testing::CountingEnv,
        transport::{BridgeHandle, BridgeTransport},
    };

    type Outbox = Arc<Mutex<Vec<Bytes>>>;

    /// Dispatcher over a bridge whose outbound payloads are collected.
    fn dispatcher(env: &CountingEnv, id: &str) -> (Dispatcher<CountingEnv>, Outbox, BridgeHandle) {
        let outbox = Outbox::default();
        let sink = Arc::clone(&outbox);
        let (bridge, handle) = BridgeTransport::new(Arc::new(move |payload: Bytes| {
            lock(&sink).push(payload);
        }));
        let dispatcher = Dispatcher::new(bridge.into(), env.clone(), DispatcherConfig::default());
        dispatcher.register_device(id);
        dispatcher.start().unwrap();
        (dispatcher, outbox, handle)
    }

    fn drain(outbox: &Outbox) -> Vec<Bytes> {
        std::mem::take(&mut *lock(outbox))
    }

    #[test]
    fn session_id_is_symmetric() {
        assert_eq!(session_id_for("alice", "bob"), session_id_for("bob", "alice"));
        assert_ne!(session_id_for("alice", "bob"), session_id_for("alice", "carol"));
        assert_ne!(session_id_for("ab", "c"), session_id_for("a", "bc"));
    }

    #[test]
    fn roles_are_opposite() {
        assert_eq!(role_for("alice", "bob").unwrap(), Role::Initiator);
        assert_eq!(role_for("bob", "alice").unwrap(), Role::Responder);
        assert!(role_for("bob", "bob").is_err());
    }

    #[test]
    fn send_without_session_is_state_error() {
        let env = CountingEnv::default();
        let (alice, outbox, _) = dispatcher(&env, "alice");

        let err = alice.send_message_to_device("bob", b"hi").unwrap_err();
        assert!(matches!(err, Error::NoSession(ref id) if id == "bob"));
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(drain(&outbox).is_empty());
    }

    #[test]
    fn send_before_register_is_state_error() {
        let env = CountingEnv::default();
        let (bridge, _) = BridgeTransport::new(Arc::new(|_: Bytes| {}));
        let d = Dispatcher::new(bridge.into(), env, DispatcherConfig::default());

        assert_eq!(d.create_session_with("bob", &[1; 32]).unwrap_err().kind(), ErrorKind::State);
        assert_eq!(d.send_message_to_device("bob", b"x").unwrap_err().kind(), ErrorKind::State);
    }

    #[test]
    fn short_root_key_rejected() {
        let env = CountingEnv::default();
        let (alice, _, _) = dispatcher(&env, "alice");
        let err = alice.create_session_with("bob", &[1; 31]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!alice.has_session("bob"));
    }

    #[test]
    fn pairwise_message_reaches_callback_once() {
        let env = CountingEnv::default();
        let (alice, alice_out, _) = dispatcher(&env, "alice");
        let (bob, _, _) = dispatcher(&env, "bob");
        alice.create_session_with("bob", &[7; 32]).unwrap();
        bob.create_session_with("alice", &[7; 32]).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bob.set_on_inbound(Arc::new(move |msg: &InboundMessage| {
            lock(&sink).push(msg.clone());
        }));

        alice.send_message_to_device("bob", b"Hi Bob").unwrap();
        for payload in drain(&alice_out) {
            bob.on_raw_message(&payload);
        }

        let seen = lock(&seen);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].plaintext, b"Hi Bob");
        assert_eq!(seen[0].sender_device_id, "alice");
        assert_eq!(seen[0].group_id, None);
    }

    #[test]
    fn misaddressed_and_garbage_payloads_dropped() {
        let env = CountingEnv::default();
        let (alice, alice_out, _) = dispatcher(&env, "alice");
        let (carol, _, _) = dispatcher(&env, "carol");
        alice.create_session_with("bob", &[7; 32]).unwrap();
        carol.create_session_with("alice", &[7; 32]).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        carol.set_on_inbound(Arc::new(move |_: &InboundMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        alice.send_message_to_device("bob", b"for bob only").unwrap();
        for payload in drain(&alice_out) {
            carol.on_raw_message(&payload);
        }
        carol.on_raw_message(b"\x00\x00\x00\x01garbage");
        carol.on_raw_message(&[]);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_reenter_dispatcher() {
        let env = CountingEnv::default();
        let (alice, alice_out, _) = dispatcher(&env, "alice");
        let (bob, bob_out, _) = dispatcher(&env, "bob");
        let bob = Arc::new(bob);
        alice.create_session_with("bob", &[9; 32]).unwrap();
        bob.create_session_with("alice", &[9; 32]).unwrap();

        let weak = Arc::downgrade(&bob);
        bob.set_on_inbound(Arc::new(move |msg: &InboundMessage| {
            if let Some(bob) = weak.upgrade() {
                bob.send_message_to_device(&msg.sender_device_id, b"ack").unwrap();
            }
        }));

        alice.send_message_to_device("bob", b"ping").unwrap();
        for payload in drain(&alice_out) {
            bob.on_raw_message(&payload);
        }

        let mut replies = alice.subscribe();
        for payload in drain(&bob_out) {
            alice.on_raw_message(&payload);
        }
        assert_eq!(replies.try_recv().unwrap().plaintext, b"ack");
    }

    #[test]
    fn group_message_routed_through_mls() {
        let env = CountingEnv::default();
        let (alice, alice_out, _) = dispatcher(&env, "alice");
        let (bob, _, _) = dispatcher(&env, "bob");

        let group = alice.create_group("team");
        alice.add_group_member(group, "alice").unwrap();
        alice.add_group_member(group, "bob").unwrap();
        let imported = bob.import_group(&alice.export_group(group).unwrap()).unwrap();
        assert_eq!(imported, group);

        let mut inbox = bob.subscribe();
        alice.send_group_message(group, "alice", b"hello team").unwrap();
        for payload in drain(&alice_out) {
            bob.on_raw_message(&payload);
        }

        let msg = inbox.try_recv().unwrap();
        assert_eq!(msg.plaintext, b"hello team");
        assert_eq!(msg.group_id, Some(group));
        assert_eq!(msg.sender_device_id, "alice");
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let env = CountingEnv::default();
        let (alice, alice_out, _) = dispatcher(&env, "alice");
        let (bob, _, _) = dispatcher(&env, "bob");
        alice.create_session_with("bob", &[3; 32]).unwrap();
        bob.create_session_with("alice", &[3; 32]).unwrap();

        drop(bob.subscribe());
        let mut live = bob.subscribe();

        alice.send_message_to_device("bob", b"one").unwrap();
        for payload in drain(&alice_out) {
            bob.on_raw_message(&payload);
        }

        assert_eq!(live.try_recv().unwrap().plaintext, b"one");
        assert_eq!(lock(&bob.shared.state).subscribers.len(), 1);
    }
}

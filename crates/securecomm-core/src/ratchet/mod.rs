//! Pairwise Double-Ratchet sessions.
//!
//! A [`Ratchet`] holds one bidirectional encrypted channel to exactly one
//! remote device. Both ends start from a 32-byte root key agreed out of band.
//!
//! # Key Schedule
//!
//! ```text
//! initialize(root, session_id, role)
//!     │
//!     ▼
//! HKDF(root, session_id) ──► root', initiator chain, responder chain
//!                                   (bootstrap chains, no DH yet)
//!     │
//!     ▼  first authentic remote public key observed
//! DH step ──► root'', fresh sending chain
//!     │
//!     ▼  every later remote key change
//! DH(local, remote) ──► receiving chain
//! DH(new local, remote) ──► sending chain
//! ```
//!
//! Until a DH step has happened in a direction, messages in that direction
//! travel on a bootstrap chain derived from the root key alone. The
//! initiator moves its sending side onto a DH chain as soon as it sees the
//! responder's public key; the responder follows once it receives that
//! first DH-keyed message. After that both ends alternate regular DH steps.
//!
//! # Security
//!
//! - Chain keys advance through HMAC; earlier message keys cannot be
//!   recomputed from a later chain key
//! - Every message key opens at most one message. Keys derived ahead for
//!   out-of-order delivery are cached, bounded by [`RatchetConfig`], and
//!   removed on use
//! - Decryption is transactional: a ciphertext that fails authentication
//!   leaves the session exactly as it was

mod header;
mod skipped;
mod snapshot;

use securecomm_crypto::{
    Aead, ChainKey, KeyPair, MessageKey, NONCE_SIZE, PublicKey, SymmetricKey,
    kdf::{derive_bootstrap, derive_root},
};
use securecomm_proto::Envelope;
use serde::{Deserialize, Serialize};

use self::{
    header::{HEADER_SIZE, Header},
    skipped::{ChainId, SkippedKeys},
};
use crate::{
    env::Environment,
    error::{Error, Result},
};

/// Which side of the session this ratchet plays.
///
/// The two ends of a session must take opposite roles; the role picks which
/// bootstrap chain is used for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Sends on the first bootstrap chain and performs the first DH step
    Initiator,
    /// Sends on the second bootstrap chain
    Responder,
}

/// Limits on out-of-order delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetConfig {
    /// Maximum message keys derived ahead in a single decrypt
    pub max_skip: u32,
    /// Maximum skipped message keys held across all chains
    pub max_cached_keys: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self { max_skip: 1000, max_cached_keys: 2000 }
    }
}

#[derive(Clone)]
struct State {
    role: Role,
    session_id: Vec<u8>,
    root_key: SymmetricKey,
    send_chain: ChainKey,
    recv_chain: ChainKey,
    previous_counter: u32,
    local: KeyPair,
    remote: Option<PublicKey>,
    /// Still sending on the bootstrap chain
    send_bootstrap: bool,
    /// Still receiving on the bootstrap chain
    recv_bootstrap: bool,
    skipped: SkippedKeys,
}

impl State {
    fn recv_chain_id(&self) -> ChainId {
        match (self.recv_bootstrap, self.remote) {
            (false, Some(remote)) => ChainId::Dh(remote),
            _ => ChainId::Bootstrap,
        }
    }

    /// Derive and cache receiving keys up to (not including) `until`.
    fn skip_to(&mut self, until: u32, config: &RatchetConfig) -> Result<()> {
        let current = self.recv_chain.index();
        if until <= current {
            return Ok(());
        }

        let skip = until - current;
        if skip > config.max_skip {
            return Err(Error::TooManySkipped { index: until, skip, max: config.max_skip });
        }

        let chain = self.recv_chain_id();
        while self.recv_chain.index() < until {
            let key = self.recv_chain.next_message_key()?;
            self.skipped.insert(chain, key, config.max_cached_keys);
        }
        Ok(())
    }

    /// Full DH step: new receiving chain from the current keypair, then a
    /// fresh keypair and a new sending chain.
    fn dh_step(&mut self, remote: PublicKey, seed: [u8; 32]) -> Result<()> {
        let (root, recv) = derive_root(&self.root_key, &self.local.diffie_hellman(&remote)?)?;
        let local = KeyPair::from_secret_bytes(seed);
        let (root, send) = derive_root(&root, &local.diffie_hellman(&remote)?)?;

        self.previous_counter = self.send_chain.index();
        self.root_key = root;
        self.recv_chain = ChainKey::new(recv);
        self.send_chain = ChainKey::new(send);
        self.local = local;
        self.remote = Some(remote);
        self.send_bootstrap = false;
        self.recv_bootstrap = false;
        Ok(())
    }

    /// Record the first remote key seen. The initiator answers it with a
    /// sending-side DH step; the responder waits for a DH-keyed message.
    fn adopt_first_remote(&mut self, remote: PublicKey, seed: [u8; 32]) -> Result<()> {
        self.remote = Some(remote);
        if self.role == Role::Initiator {
            self.send_step(remote, seed)?;
        }
        Ok(())
    }

    /// Sending-only DH step taken by the initiator on first seeing the
    /// responder's key. The receiving side stays on the bootstrap chain until
    /// the responder answers with a DH-keyed message.
    fn send_step(&mut self, remote: PublicKey, seed: [u8; 32]) -> Result<()> {
        let local = KeyPair::from_secret_bytes(seed);
        let (root, send) = derive_root(&self.root_key, &local.diffie_hellman(&remote)?)?;

        self.previous_counter = self.send_chain.index();
        self.root_key = root;
        self.send_chain = ChainKey::new(send);
        self.local = local;
        self.send_bootstrap = false;
        Ok(())
    }
}

/// One end of a pairwise encrypted session.
///
/// Every operation other than [`Ratchet::initialize`] and
/// [`Ratchet::import_state`] fails with [`Error::NotInitialized`] until the
/// session has been set up.
pub struct Ratchet<E: Environment> {
    env: E,
    config: RatchetConfig,
    state: Option<State>,
}

impl<E: Environment> Ratchet<E> {
    /// Create an uninitialized ratchet.
    pub fn new(env: E, config: RatchetConfig) -> Self {
        Self { env, config, state: None }
    }

    /// Reset all session state from an agreed root key.
    ///
    /// Generates a fresh local keypair, zeroes both counters and clears the
    /// skipped-key cache. The remote end must use the same `root_key` and
    /// `session_id` with the opposite `role`.
    pub fn initialize(
        &mut self,
        root_key: &SymmetricKey,
        session_id: &[u8],
        role: Role,
    ) -> Result<()> {
        let (root, initiator_chain, responder_chain) = derive_bootstrap(root_key, session_id)?;
        let (send, recv) = match role {
            Role::Initiator => (initiator_chain, responder_chain),
            Role::Responder => (responder_chain, initiator_chain),
        };
        let local = KeyPair::from_secret_bytes(self.env.random_array());

        tracing::debug!(?role, public = ?local.public(), "ratchet initialized");

        self.state = Some(State {
            role,
            session_id: session_id.to_vec(),
            root_key: root,
            send_chain: ChainKey::new(send),
            recv_chain: ChainKey::new(recv),
            previous_counter: 0,
            local,
            remote: None,
            send_bootstrap: true,
            recv_bootstrap: true,
            skipped: SkippedKeys::default(),
        });
        Ok(())
    }

    /// True once [`Self::initialize`] or [`Self::import_state`] succeeded.
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Advance the DH ratchet to `remote`.
    ///
    /// Does exactly what [`Self::decrypt`] does when a header first carries
    /// `remote`, so a key learned out of band can be applied ahead of the
    /// message:
    ///
    /// - no-op if `remote` is the last recorded remote key
    /// - the first remote key is recorded; the initiator also moves its
    ///   sending side onto a DH chain from DH(fresh local, remote)
    /// - any later key derives a receiving chain from DH(local, remote),
    ///   generates a fresh local keypair and derives a sending chain from
    ///   DH(new local, remote)
    pub fn ratchet_step(&mut self, remote: &PublicKey) -> Result<()> {
        let seed = self.env.random_array();
        let state = self.state_mut("ratchet_step")?;
        match state.remote {
            Some(current) if current == *remote => return Ok(()),
            None => state.adopt_first_remote(*remote, seed)?,
            Some(_) => state.dh_step(*remote, seed)?,
        }
        tracing::debug!(?remote, "ratchet step");
        Ok(())
    }

    /// Encrypt `plaintext`, authenticating `aad`.
    ///
    /// Returns `header || nonce || ciphertext || tag`.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.seal(plaintext, aad).map(|(_, blob)| blob)
    }

    /// Decrypt output of the remote's [`Self::encrypt`].
    ///
    /// Accepts messages out of order: keys for skipped message numbers are
    /// derived and cached, and a later arrival consumes its cached key.
    ///
    /// # Errors
    ///
    /// - `Malformed` if the header cannot be parsed
    /// - `Replay` if the message's key was already used or discarded
    /// - `TooManySkipped` if reaching the message would skip too many keys
    /// - `Crypto` on authentication failure
    pub fn decrypt(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let config = self.config;
        let seed = self.env.random_array();
        let state = self.state_mut("decrypt")?;
        let (header, sealed) = Header::decode(ciphertext)?;
        let aad = header.associated_data(aad);

        let chain =
            if header.bootstrap { ChainId::Bootstrap } else { ChainId::Dh(header.dh_public) };
        if let Some(key) = state.skipped.get(chain, header.message_number) {
            let plaintext = open(key, sealed, &aad)?;
            state.skipped.remove(chain, header.message_number);
            return Ok(plaintext);
        }

        // Work on a copy; nothing is committed unless the payload opens
        let mut next = state.clone();

        if header.bootstrap {
            if !next.recv_bootstrap {
                return Err(Error::Replay { index: header.message_number });
            }
            let recorded = next.remote;
            match recorded {
                None => next.adopt_first_remote(header.dh_public, seed)?,
                Some(remote) if remote != header.dh_public => {
                    return Err(Error::malformed("ratchet header", "bootstrap key changed"));
                },
                Some(_) => {},
            }
        } else if next.remote != Some(header.dh_public) {
            next.skip_to(header.previous_counter, &config)?;
            next.dh_step(header.dh_public, seed)?;
        }

        if header.message_number < next.recv_chain.index() {
            return Err(Error::Replay { index: header.message_number });
        }
        next.skip_to(header.message_number, &config)?;
        let key = next.recv_chain.next_message_key()?;
        let plaintext = open(&key, sealed, &aad)?;

        if next.remote != state.remote || next.send_bootstrap != state.send_bootstrap {
            tracing::debug!(remote = ?next.remote, "ratchet advanced on receive");
        }
        *state = next;
        Ok(plaintext)
    }

    /// Encrypt into an [`Envelope`] addressed from `sender` to `receiver`.
    ///
    /// The envelope's associated data binds both device ids, so an envelope
    /// re-addressed in transit fails to decrypt.
    pub fn encrypt_envelope(
        &mut self,
        plaintext: &[u8],
        sender: &str,
        receiver: &str,
    ) -> Result<Envelope> {
        let associated_data = device_binding(sender, receiver);
        let (header, ciphertext) = self.seal(plaintext, &associated_data)?;
        let session_id = self.state_ref("encrypt_envelope")?.session_id.clone();

        Ok(Envelope {
            session_id,
            message_index: header.message_number,
            previous_counter: header.previous_counter,
            timestamp: self.env.unix_millis(),
            sender_device_id: sender.to_string(),
            receiver_device_id: receiver.to_string(),
            ciphertext,
            associated_data,
            ..Envelope::new()
        })
    }

    /// Decrypt an envelope produced by the remote's [`Self::encrypt_envelope`].
    ///
    /// Checks the session id, the header counters against the envelope's
    /// clear fields and the device binding before decrypting.
    pub fn decrypt_envelope(&mut self, envelope: &Envelope) -> Result<Vec<u8>> {
        let state = self.state_ref("decrypt_envelope")?;
        if envelope.session_id != state.session_id {
            return Err(Error::malformed("envelope", "session id does not match this session"));
        }

        let (header, _) = Header::decode(&envelope.ciphertext)?;
        if header.message_number != envelope.message_index
            || header.previous_counter != envelope.previous_counter
        {
            return Err(Error::malformed("envelope", "counters disagree with ratchet header"));
        }

        let expected = device_binding(&envelope.sender_device_id, &envelope.receiver_device_id);
        if envelope.associated_data != expected {
            return Err(Error::malformed("envelope", "associated data does not bind device ids"));
        }

        self.decrypt(&envelope.ciphertext, &envelope.associated_data)
    }

    /// Serialize the complete session state.
    pub fn export_state(&self) -> Result<Vec<u8>> {
        snapshot::export(self.state_ref("export_state")?)
    }

    /// Replace this ratchet's state with one produced by
    /// [`Self::export_state`].
    pub fn import_state(&mut self, blob: &[u8]) -> Result<()> {
        self.state = Some(snapshot::import(blob, self.config.max_cached_keys)?);
        Ok(())
    }

    /// Current local ratchet public key.
    pub fn dh_public_key(&self) -> Option<PublicKey> {
        self.state.as_ref().map(|s| s.local.public())
    }

    /// Session id given at initialization.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.state.as_ref().map(|s| s.session_id.as_slice())
    }

    /// Messages sent on the current sending chain.
    pub fn send_counter(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.send_chain.index())
    }

    /// Next expected message number on the current receiving chain.
    pub fn recv_counter(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.recv_chain.index())
    }

    /// Cached keys for messages not yet received.
    pub fn skipped_key_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.skipped.len())
    }

    fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(Header, Vec<u8>)> {
        let nonce: [u8; NONCE_SIZE] = self.env.random_array();
        let state = self.state_mut("encrypt")?;

        let mut chain = state.send_chain.clone();
        let key = chain.next_message_key()?;
        let header = Header {
            dh_public: state.local.public(),
            previous_counter: state.previous_counter,
            message_number: key.index(),
            bootstrap: state.send_bootstrap,
        };

        let sealed = Aead::new(key.key()).encrypt(&nonce, plaintext, &header.associated_data(aad))?;
        state.send_chain = chain;

        let mut blob = Vec::with_capacity(HEADER_SIZE + sealed.len());
        blob.extend_from_slice(&header.encode());
        blob.extend_from_slice(&sealed);
        Ok((header, blob))
    }

    fn state_ref(&self, operation: &'static str) -> Result<&State> {
        self.state.as_ref().ok_or(Error::NotInitialized { operation })
    }

    fn state_mut(&mut self, operation: &'static str) -> Result<&mut State> {
        self.state.as_mut().ok_or(Error::NotInitialized { operation })
    }
}

fn open(key: &MessageKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    Ok(Aead::new(key.key()).decrypt(sealed, aad)?)
}

/// Length-prefixed `sender || receiver`, used as envelope associated data.
pub(crate) fn device_binding(sender: &str, receiver: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + sender.len() + receiver.len());
    for id in [sender, receiver] {
        out.extend_from_slice(&(id.len() as u32).to_be_bytes());
        out.extend_from_slice(id.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testing::CountingEnv;

    fn pair() -> (Ratchet<CountingEnv>, Ratchet<CountingEnv>) {
        let env = CountingEnv::default();
        let root = SymmetricKey::from_bytes([0x42; 32]);
        let mut alice = Ratchet::new(env.clone(), RatchetConfig::default());
        let mut bob = Ratchet::new(env, RatchetConfig::default());
        alice.initialize(&root, b"session", Role::Initiator).unwrap();
        bob.initialize(&root, b"session", Role::Responder).unwrap();
        (alice, bob)
    }

    #[test]
    fn operations_before_initialize_fail() {
        let mut ratchet = Ratchet::new(CountingEnv::default(), RatchetConfig::default());
        assert!(matches!(
            ratchet.encrypt(b"x", b""),
            Err(Error::NotInitialized { operation: "encrypt" })
        ));
        assert!(matches!(ratchet.decrypt(&[0; 64], b""), Err(Error::NotInitialized { .. })));
        assert!(matches!(ratchet.export_state(), Err(Error::NotInitialized { .. })));
        assert!(!ratchet.is_initialized());
    }

    #[test]
    fn bootstrap_exchange_in_both_directions() {
        let (mut alice, mut bob) = pair();

        let ct = alice.encrypt(b"hello bob", b"").unwrap();
        assert_eq!(bob.decrypt(&ct, b"").unwrap(), b"hello bob");

        let ct = bob.encrypt(b"hello alice", b"").unwrap();
        assert_eq!(alice.decrypt(&ct, b"").unwrap(), b"hello alice");
    }

    #[test]
    fn responder_may_send_first() {
        let (mut alice, mut bob) = pair();

        let ct = bob.encrypt(b"first", b"").unwrap();
        assert_eq!(alice.decrypt(&ct, b"").unwrap(), b"first");

        let ct = alice.encrypt(b"reply", b"").unwrap();
        assert_eq!(bob.decrypt(&ct, b"").unwrap(), b"reply");
    }

    #[test]
    fn initiator_steps_after_seeing_responder_key() {
        let (mut alice, mut bob) = pair();
        let before = alice.dh_public_key();

        let ct = bob.encrypt(b"ping", b"").unwrap();
        alice.decrypt(&ct, b"").unwrap();
        assert_ne!(alice.dh_public_key(), before);

        let ct = alice.encrypt(b"pong", b"").unwrap();
        let bob_before = bob.dh_public_key();
        assert_eq!(bob.decrypt(&ct, b"").unwrap(), b"pong");
        assert_ne!(bob.dh_public_key(), bob_before);
    }

    #[test]
    fn second_decrypt_is_replay() {
        let (mut alice, mut bob) = pair();
        let ct = alice.encrypt(b"once", b"").unwrap();

        bob.decrypt(&ct, b"").unwrap();
        assert!(matches!(bob.decrypt(&ct, b""), Err(Error::Replay { index: 0 })));
    }

    #[test]
    fn tampered_ciphertext_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();
        let c0 = alice.encrypt(b"zero", b"").unwrap();
        let mut c1 = alice.encrypt(b"one", b"").unwrap();
        let last = c1.len() - 1;
        c1[last] ^= 0x80;

        assert!(matches!(bob.decrypt(&c1, b""), Err(Error::Crypto(_))));
        assert_eq!(bob.skipped_key_count(), 0);
        assert_eq!(bob.recv_counter(), 0);
        assert_eq!(bob.decrypt(&c0, b"").unwrap(), b"zero");
    }

    #[test]
    fn wrong_aad_fails() {
        let (mut alice, mut bob) = pair();
        let ct = alice.encrypt(b"msg", b"context-a").unwrap();
        assert!(bob.decrypt(&ct, b"context-b").is_err());
        assert_eq!(bob.decrypt(&ct, b"context-a").unwrap(), b"msg");
    }

    #[test]
    fn skip_limit_enforced() {
        let env = CountingEnv::default();
        let root = SymmetricKey::from_bytes([1; 32]);
        let config = RatchetConfig { max_skip: 2, max_cached_keys: 10 };
        let mut alice = Ratchet::new(env.clone(), config);
        let mut bob = Ratchet::new(env, config);
        alice.initialize(&root, b"s", Role::Initiator).unwrap();
        bob.initialize(&root, b"s", Role::Responder).unwrap();

        let sent: Vec<_> = (0..4).map(|_| alice.encrypt(b"m", b"").unwrap()).collect();
        assert!(matches!(
            bob.decrypt(&sent[3], b""),
            Err(Error::TooManySkipped { index: 3, skip: 3, max: 2 })
        ));
        assert_eq!(bob.decrypt(&sent[2], b"").unwrap(), b"m");
        assert_eq!(bob.skipped_key_count(), 2);
    }

    #[test]
    fn ratchet_step_with_same_key_is_noop() {
        let (mut alice, _) = pair();
        let remote = KeyPair::from_secret_bytes([7; 32]).public();

        alice.ratchet_step(&remote).unwrap();
        let after_first = alice.dh_public_key();
        alice.ratchet_step(&remote).unwrap();
        assert_eq!(alice.dh_public_key(), after_first);
    }

    #[test]
    fn keys_learned_out_of_band_interoperate() {
        let (mut alice, mut bob) = pair();
        let alice_key = alice.dh_public_key().unwrap();
        let bob_key = bob.dh_public_key().unwrap();

        alice.ratchet_step(&bob_key).unwrap();
        bob.ratchet_step(&alice_key).unwrap();
        assert_ne!(alice.dh_public_key(), Some(alice_key));
        assert_eq!(bob.dh_public_key(), Some(bob_key));

        let ct = alice.encrypt(b"after exchange", b"").unwrap();
        assert_eq!(bob.decrypt(&ct, b"").unwrap(), b"after exchange");
        assert_ne!(bob.dh_public_key(), Some(bob_key));

        let reply = bob.encrypt(b"reply", b"").unwrap();
        assert_eq!(alice.decrypt(&reply, b"").unwrap(), b"reply");
        assert_eq!(alice.skipped_key_count(), 0);
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn responder_may_send_first_after_out_of_band_exchange() {
        let (mut alice, mut bob) = pair();
        let alice_key = alice.dh_public_key().unwrap();
        let bob_key = bob.dh_public_key().unwrap();
        alice.ratchet_step(&bob_key).unwrap();
        bob.ratchet_step(&alice_key).unwrap();

        let ct = bob.encrypt(b"bootstrap still open", b"").unwrap();
        assert_eq!(alice.decrypt(&ct, b"").unwrap(), b"bootstrap still open");
        let ct = alice.encrypt(b"answer", b"").unwrap();
        assert_eq!(bob.decrypt(&ct, b"").unwrap(), b"answer");
    }

    #[test]
    fn ratchet_step_after_first_key_is_full_step() {
        let (mut alice, mut bob) = pair();
        let ct = alice.encrypt(b"one", b"").unwrap();
        bob.decrypt(&ct, b"").unwrap();
        let ct = bob.encrypt(b"two", b"").unwrap();
        alice.decrypt(&ct, b"").unwrap();
        let ct = alice.encrypt(b"three", b"").unwrap();
        bob.decrypt(&ct, b"").unwrap();

        // Step to bob's current key before his message arrives; decrypt then
        // needs no further step
        let bob_key = bob.dh_public_key().unwrap();
        alice.ratchet_step(&bob_key).unwrap();
        let stepped = alice.dh_public_key();
        let ct = bob.encrypt(b"four", b"").unwrap();
        assert_eq!(alice.decrypt(&ct, b"").unwrap(), b"four");
        assert_eq!(alice.dh_public_key(), stepped);
    }

    #[test]
    fn envelope_rejects_rebinding() {
        let (mut alice, mut bob) = pair();
        let mut env = alice.encrypt_envelope(b"hi", "alice", "bob").unwrap();
        env.receiver_device_id = "mallory".to_string();
        assert!(matches!(bob.decrypt_envelope(&env), Err(Error::Malformed { .. })));
    }

    #[test]
    fn envelope_rejects_foreign_session() {
        let (mut alice, mut bob) = pair();
        let mut env = alice.encrypt_envelope(b"hi", "alice", "bob").unwrap();
        env.session_id = b"other".to_vec();
        assert!(matches!(bob.decrypt_envelope(&env), Err(Error::Malformed { .. })));
    }

    #[test]
    fn device_binding_is_length_prefixed() {
        assert_ne!(device_binding("ab", "c"), device_binding("a", "bc"));
    }
}

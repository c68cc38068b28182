//! Exported ratchet state.
//!
//! A versioned CBOR record holding every mutable field of an initialized
//! session. Skipped keys are stored oldest first so a restored session
//! evicts in the same order and re-exports to the same bytes.

use securecomm_crypto::{ChainKey, KeyPair, MessageKey, PublicKey, SymmetricKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{Role, State, skipped::ChainId, skipped::SkippedKeys};
use crate::error::{Error, Result};

const SNAPSHOT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct RatchetSnapshot {
    version: u8,
    role: Role,
    session_id: Vec<u8>,
    root_key: [u8; 32],
    send_chain_key: [u8; 32],
    send_index: u32,
    recv_chain_key: [u8; 32],
    recv_index: u32,
    previous_counter: u32,
    local_secret: [u8; 32],
    remote: Option<[u8; 32]>,
    send_bootstrap: bool,
    recv_bootstrap: bool,
    skipped: Vec<SkippedEntry>,
}

#[derive(Serialize, Deserialize)]
struct SkippedEntry {
    /// Remote public key of the chain, `None` for the bootstrap chain
    chain: Option<[u8; 32]>,
    index: u32,
    key: [u8; 32],
}

impl Drop for RatchetSnapshot {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        self.local_secret.zeroize();
    }
}

impl Drop for SkippedEntry {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

pub(super) fn export(state: &State) -> Result<Vec<u8>> {
    let snapshot = RatchetSnapshot {
        version: SNAPSHOT_VERSION,
        role: state.role,
        session_id: state.session_id.clone(),
        root_key: *state.root_key.as_bytes(),
        send_chain_key: *state.send_chain.key().as_bytes(),
        send_index: state.send_chain.index(),
        recv_chain_key: *state.recv_chain.key().as_bytes(),
        recv_index: state.recv_chain.index(),
        previous_counter: state.previous_counter,
        local_secret: *state.local.secret_bytes(),
        remote: state.remote.map(PublicKey::to_bytes),
        send_bootstrap: state.send_bootstrap,
        recv_bootstrap: state.recv_bootstrap,
        skipped: state
            .skipped
            .iter()
            .map(|(chain, key)| SkippedEntry {
                chain: match chain {
                    ChainId::Bootstrap => None,
                    ChainId::Dh(public) => Some(public.to_bytes()),
                },
                index: key.index(),
                key: *key.key().as_bytes(),
            })
            .collect(),
    };

    let mut out = Vec::new();
    ciborium::into_writer(&snapshot, &mut out)
        .map_err(|e| Error::invalid_state("export_state", e.to_string()))?;
    Ok(out)
}

pub(super) fn import(blob: &[u8], max_cached_keys: usize) -> Result<State> {
    let snapshot: RatchetSnapshot =
        ciborium::from_reader(blob).map_err(|e| Error::malformed("ratchet state", e.to_string()))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::malformed(
            "ratchet state",
            format!("unsupported snapshot version {}", snapshot.version),
        ));
    }

    let mut skipped = SkippedKeys::default();
    // Keep every exported entry even if the local cap is smaller; the cap
    // applies again on the next insert.
    let capacity = max_cached_keys.max(snapshot.skipped.len());
    for entry in &snapshot.skipped {
        let chain = match entry.chain {
            None => ChainId::Bootstrap,
            Some(public) => ChainId::Dh(PublicKey::from_bytes(public)),
        };
        let key = MessageKey::from_parts(SymmetricKey::from_bytes(entry.key), entry.index);
        skipped.insert(chain, key, capacity);
    }

    Ok(State {
        role: snapshot.role,
        session_id: snapshot.session_id.clone(),
        root_key: SymmetricKey::from_bytes(snapshot.root_key),
        send_chain: ChainKey::from_parts(
            SymmetricKey::from_bytes(snapshot.send_chain_key),
            snapshot.send_index,
        ),
        recv_chain: ChainKey::from_parts(
            SymmetricKey::from_bytes(snapshot.recv_chain_key),
            snapshot.recv_index,
        ),
        previous_counter: snapshot.previous_counter,
        local: KeyPair::from_secret_bytes(snapshot.local_secret),
        remote: snapshot.remote.map(PublicKey::from_bytes),
        send_bootstrap: snapshot.send_bootstrap,
        recv_bootstrap: snapshot.recv_bootstrap,
        skipped,
    })
}

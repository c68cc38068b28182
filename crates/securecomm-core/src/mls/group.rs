//! Group record: membership, leaf secrets and the epoch secret window.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use securecomm_crypto::{
    KEY_SIZE, SymmetricKey,
    kdf::{digest, keyed_hash},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Random 128-bit group identifier.
///
/// Encoded big-endian as the envelope `session_id` of group traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u128);

impl GroupId {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Wrap a raw id.
    pub const fn from_u128(id: u128) -> Self {
        Self(id)
    }

    /// Raw id.
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Big-endian encoding.
    pub const fn to_bytes(self) -> [u8; Self::SIZE] {
        self.0.to_be_bytes()
    }

    /// Parse a big-endian encoding. `None` unless `bytes` is exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; Self::SIZE] = bytes.try_into().ok()?;
        Some(Self(u128::from_be_bytes(array)))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Per-epoch message key: HMAC-SHA-256(epoch_secret, group_id || epoch).
pub fn derive_epoch_key(
    epoch_secret: &SymmetricKey,
    group: GroupId,
    epoch: u64,
) -> Result<SymmetricKey> {
    Ok(keyed_hash(epoch_secret.as_bytes(), &epoch_aad(group, epoch))?)
}

/// Associated data binding a group ciphertext to its epoch.
pub(crate) fn epoch_aad(group: GroupId, epoch: u64) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[..16].copy_from_slice(&group.to_bytes());
    out[16..].copy_from_slice(&epoch.to_be_bytes());
    out
}

/// Inverse of [`epoch_aad`].
pub(crate) fn parse_epoch_aad(aad: &[u8]) -> Result<(GroupId, u64)> {
    if aad.len() != 24 {
        return Err(Error::malformed("group associated data", format!("{} bytes", aad.len())));
    }
    let group = GroupId::from_slice(&aad[..16])
        .ok_or_else(|| Error::malformed("group associated data", "bad group id"))?;
    let mut epoch = [0u8; 8];
    epoch.copy_from_slice(&aad[16..]);
    Ok((group, u64::from_be_bytes(epoch)))
}

struct Leaf {
    member: String,
    secret: SymmetricKey,
}

pub(crate) struct Group {
    pub(crate) id: GroupId,
    pub(crate) name: String,
    pub(crate) epoch: u64,
    leaves: Vec<Leaf>,
    member_index: HashMap<String, usize>,
    pub(crate) epoch_secret: SymmetricKey,
    /// Superseded epoch secrets, newest last
    history: VecDeque<(u64, SymmetricKey)>,
}

impl Group {
    pub(crate) fn new(id: GroupId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            epoch: 1,
            leaves: Vec::new(),
            member_index: HashMap::new(),
            epoch_secret: epoch_secret(&[]),
            history: VecDeque::new(),
        }
    }

    pub(crate) fn contains(&self, member: &str) -> bool {
        self.member_index.contains_key(member)
    }

    /// Member ids in leaf order.
    pub(crate) fn members(&self) -> impl Iterator<Item = &str> {
        self.leaves.iter().map(|leaf| leaf.member.as_str())
    }

    pub(crate) fn leaf_secret(&self, member: &str) -> Option<&SymmetricKey> {
        self.member_index.get(member).map(|&i| &self.leaves[i].secret)
    }

    pub(crate) fn add(&mut self, member: &str, secret: SymmetricKey, retention: usize) -> Result<u64> {
        if self.contains(member) {
            return Err(Error::invalid_state(
                "add_member",
                format!("{member} is already a member of group {}", self.id),
            ));
        }
        let next_epoch = self.next_epoch()?;

        self.member_index.insert(member.to_string(), self.leaves.len());
        self.leaves.push(Leaf { member: member.to_string(), secret });
        self.advance(next_epoch, retention);
        Ok(self.epoch)
    }

    pub(crate) fn remove(&mut self, member: &str, retention: usize) -> Result<u64> {
        let Some(&index) = self.member_index.get(member) else {
            return Err(Error::MemberNotFound { group: self.id, member: member.to_string() });
        };
        let next_epoch = self.next_epoch()?;

        // Dropping the leaf zeroizes its secret
        self.leaves.remove(index);
        self.member_index.remove(member);
        for slot in self.member_index.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        self.advance(next_epoch, retention);
        Ok(self.epoch)
    }

    /// Epoch secret for `epoch`, if it is current or still retained.
    pub(crate) fn secret_for(&self, epoch: u64) -> Option<&SymmetricKey> {
        if epoch == self.epoch {
            return Some(&self.epoch_secret);
        }
        self.history.iter().find(|(e, _)| *e == epoch).map(|(_, secret)| secret)
    }

    fn next_epoch(&self) -> Result<u64> {
        self.epoch
            .checked_add(1)
            .ok_or_else(|| Error::invalid_state("advance_epoch", "epoch counter exhausted"))
    }

    fn advance(&mut self, next_epoch: u64, retention: usize) {
        let secrets: Vec<&SymmetricKey> = self.leaves.iter().map(|leaf| &leaf.secret).collect();
        let next_secret = epoch_secret(&secrets);
        let previous = std::mem::replace(&mut self.epoch_secret, next_secret);

        self.history.push_back((self.epoch, previous));
        while self.history.len() > retention {
            self.history.pop_front();
        }
        self.epoch = next_epoch;
    }

    pub(crate) fn to_snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            version: GROUP_SNAPSHOT_VERSION,
            id: self.id.to_bytes(),
            name: self.name.clone(),
            epoch: self.epoch,
            leaves: self
                .leaves
                .iter()
                .map(|leaf| (leaf.member.clone(), *leaf.secret.as_bytes()))
                .collect(),
            history: self.history.iter().map(|(e, s)| (*e, *s.as_bytes())).collect(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: &GroupSnapshot, retention: usize) -> Result<Self> {
        if snapshot.version != GROUP_SNAPSHOT_VERSION {
            return Err(Error::malformed(
                "group state",
                format!("unsupported snapshot version {}", snapshot.version),
            ));
        }
        if snapshot.epoch == 0 {
            return Err(Error::malformed("group state", "epoch 0"));
        }

        let mut leaves = Vec::with_capacity(snapshot.leaves.len());
        let mut member_index = HashMap::with_capacity(snapshot.leaves.len());
        for (member, secret) in &snapshot.leaves {
            if member_index.insert(member.clone(), leaves.len()).is_some() {
                return Err(Error::malformed("group state", format!("duplicate member {member}")));
            }
            leaves.push(Leaf { member: member.clone(), secret: SymmetricKey::from_bytes(*secret) });
        }

        let secrets: Vec<&SymmetricKey> = leaves.iter().map(|leaf| &leaf.secret).collect();
        let epoch_secret = epoch_secret(&secrets);

        let mut history: VecDeque<(u64, SymmetricKey)> = snapshot
            .history
            .iter()
            .filter(|(e, _)| *e < snapshot.epoch)
            .map(|(e, s)| (*e, SymmetricKey::from_bytes(*s)))
            .collect();
        while history.len() > retention {
            history.pop_front();
        }

        Ok(Self {
            id: GroupId::from_u128(u128::from_be_bytes(snapshot.id)),
            name: snapshot.name.clone(),
            epoch: snapshot.epoch,
            leaves,
            member_index,
            epoch_secret,
            history,
        })
    }
}

/// SHA-256 over the concatenated leaf secrets in index order; 32 zero bytes
/// for an empty group.
fn epoch_secret(leaves: &[&SymmetricKey]) -> SymmetricKey {
    if leaves.is_empty() {
        return SymmetricKey::zero();
    }
    let mut input = Vec::with_capacity(leaves.len() * KEY_SIZE);
    for leaf in leaves {
        input.extend_from_slice(leaf.as_bytes());
    }
    let out = SymmetricKey::from_bytes(digest(&input));
    input.zeroize();
    out
}

const GROUP_SNAPSHOT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
pub(crate) struct GroupSnapshot {
    version: u8,
    id: [u8; 16],
    name: String,
    epoch: u64,
    leaves: Vec<(String, [u8; 32])>,
    history: Vec<(u64, [u8; 32])>,
}

impl Drop for GroupSnapshot {
    fn drop(&mut self) {
        for (_, secret) in &mut self.leaves {
            secret.zeroize();
        }
        for (_, secret) in &mut self.history {
            secret.zeroize();
        }
    }
}

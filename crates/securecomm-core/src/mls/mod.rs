//! Epoch-keyed group encryption.
//!
//! Every group member holds a random 32-byte leaf secret. The group's epoch
//! secret is a digest over all leaf secrets in member order, and every
//! membership change bumps the epoch and recomputes it. Messages are sealed
//! under a per-epoch key derived from the epoch secret.
//!
//! # Security
//!
//! - A removed member's leaf secret is purged and contributes to no later
//!   epoch secret. Knowing the old epoch secret or its own leaf does not let
//!   it derive the key of any epoch after its removal
//! - Ciphertexts carry `group_id || epoch` as associated data, so a message
//!   cannot be replayed into another group or relabelled with another epoch
//! - A bounded window of superseded epoch secrets ([`MlsConfig`]) lets
//!   messages sent just before a membership change still decrypt. Set the
//!   retention to zero to accept only the current epoch

mod group;

use std::collections::HashMap;

use securecomm_crypto::{Aead, NONCE_SIZE, SymmetricKey};
use securecomm_proto::Envelope;

pub use self::group::{GroupId, derive_epoch_key};
use self::group::{Group, GroupSnapshot, epoch_aad, parse_epoch_aad};
use crate::{
    env::Environment,
    error::{Error, Result},
};

/// Group manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MlsConfig {
    /// Superseded epoch secrets kept for late messages
    pub epoch_retention: usize,
}

impl Default for MlsConfig {
    fn default() -> Self {
        Self { epoch_retention: 4 }
    }
}

/// Owner of every group record on this device.
pub struct MlsManager<E: Environment> {
    env: E,
    config: MlsConfig,
    groups: HashMap<GroupId, Group>,
}

impl<E: Environment> MlsManager<E> {
    /// Create a manager with no groups.
    pub fn new(env: E, config: MlsConfig) -> Self {
        Self { env, config, groups: HashMap::new() }
    }

    /// Create an empty group at epoch 1 and return its random id.
    pub fn create_group(&mut self, name: &str) -> GroupId {
        let id = loop {
            let candidate = GroupId::from_u128(u128::from_be_bytes(self.env.random_array()));
            if !self.groups.contains_key(&candidate) {
                break candidate;
            }
        };

        self.groups.insert(id, Group::new(id, name));
        tracing::info!(group = %id, name, "group created");
        id
    }

    /// Add `member` with a fresh leaf secret. Returns the new epoch.
    ///
    /// # Errors
    ///
    /// - `GroupNotFound` for an unknown group
    /// - `InvalidState` if `member` is already in the group
    pub fn add_member(&mut self, group: GroupId, member: &str) -> Result<u64> {
        let leaf = SymmetricKey::from_bytes(self.env.random_array());
        let retention = self.config.epoch_retention;
        let epoch = self.group_mut(group)?.add(member, leaf, retention)?;
        tracing::debug!(%group, member, epoch, "member added");
        Ok(epoch)
    }

    /// Remove `member` and purge its leaf secret. Returns the new epoch.
    ///
    /// # Errors
    ///
    /// - `GroupNotFound` for an unknown group
    /// - `MemberNotFound` if `member` is not in the group
    pub fn remove_member(&mut self, group: GroupId, member: &str) -> Result<u64> {
        let retention = self.config.epoch_retention;
        let epoch = self.group_mut(group)?.remove(member, retention)?;
        tracing::debug!(%group, member, epoch, "member removed");
        Ok(epoch)
    }

    /// Seal `plaintext` under the group's current epoch key.
    ///
    /// `sender` must be a current member.
    pub fn encrypt_group_message(
        &self,
        group: GroupId,
        sender: &str,
        plaintext: &[u8],
    ) -> Result<Envelope> {
        let record = self.group_ref(group)?;
        if !record.contains(sender) {
            return Err(Error::MemberNotFound { group, member: sender.to_string() });
        }

        let key = derive_epoch_key(&record.epoch_secret, group, record.epoch)?;
        let aad = epoch_aad(group, record.epoch);
        let nonce: [u8; NONCE_SIZE] = self.env.random_array();
        let ciphertext = Aead::new(&key).encrypt(&nonce, plaintext, &aad)?;

        Ok(Envelope {
            session_id: group.to_bytes().to_vec(),
            timestamp: self.env.unix_millis(),
            sender_device_id: sender.to_string(),
            ciphertext,
            associated_data: aad.to_vec(),
            ..Envelope::new()
        })
    }

    /// Open a group envelope on behalf of `member`.
    ///
    /// # Errors
    ///
    /// - `GroupNotFound` / `MemberNotFound` for an unknown group or member
    /// - `Malformed` if the envelope is not bound to this group
    /// - `EpochMismatch` if the envelope's epoch is neither current nor
    ///   retained
    /// - `Crypto` on authentication failure
    pub fn decrypt_group_message(
        &self,
        group: GroupId,
        member: &str,
        envelope: &Envelope,
    ) -> Result<Vec<u8>> {
        let record = self.group_ref(group)?;
        if !record.contains(member) {
            return Err(Error::MemberNotFound { group, member: member.to_string() });
        }
        if GroupId::from_slice(&envelope.session_id) != Some(group) {
            return Err(Error::malformed("group envelope", "session id is not this group"));
        }

        let (bound_group, epoch) = parse_epoch_aad(&envelope.associated_data)?;
        if bound_group != group {
            return Err(Error::malformed("group envelope", "bound to another group"));
        }
        let secret = record
            .secret_for(epoch)
            .ok_or(Error::EpochMismatch { epoch, current: record.epoch })?;

        let key = derive_epoch_key(secret, group, epoch)?;
        Ok(Aead::new(&key).decrypt(&envelope.ciphertext, &envelope.associated_data)?)
    }

    /// Current epoch of `group`.
    pub fn group_epoch(&self, group: GroupId) -> Option<u64> {
        self.groups.get(&group).map(|g| g.epoch)
    }

    /// Current epoch secret of `group`.
    pub fn epoch_secret(&self, group: GroupId) -> Option<&SymmetricKey> {
        self.groups.get(&group).map(|g| &g.epoch_secret)
    }

    /// Members of `group` in leaf order.
    pub fn members(&self, group: GroupId) -> Option<Vec<&str>> {
        self.groups.get(&group).map(|g| g.members().collect())
    }

    /// Display name given at creation.
    pub fn group_name(&self, group: GroupId) -> Option<&str> {
        self.groups.get(&group).map(|g| g.name.as_str())
    }

    /// True if `group` is known.
    pub fn has_group(&self, group: GroupId) -> bool {
        self.groups.contains_key(&group)
    }

    /// Leaf secret of `member`, if it is in `group`.
    pub fn leaf_secret(&self, group: GroupId, member: &str) -> Option<&SymmetricKey> {
        self.groups.get(&group).and_then(|g| g.leaf_secret(member))
    }

    /// Serialize a group record for installation on another device.
    pub fn export_group(&self, group: GroupId) -> Result<Vec<u8>> {
        let snapshot = self.group_ref(group)?.to_snapshot();
        let mut out = Vec::new();
        ciborium::into_writer(&snapshot, &mut out)
            .map_err(|e| Error::invalid_state("export_group", e.to_string()))?;
        Ok(out)
    }

    /// Install a group exported by [`Self::export_group`], replacing any
    /// local record with the same id.
    pub fn import_group(&mut self, blob: &[u8]) -> Result<GroupId> {
        let snapshot: GroupSnapshot =
            ciborium::from_reader(blob).map_err(|e| Error::malformed("group state", e.to_string()))?;
        let group = Group::from_snapshot(&snapshot, self.config.epoch_retention)?;
        let id = group.id;

        tracing::debug!(group = %id, epoch = group.epoch, "group imported");
        self.groups.insert(id, group);
        Ok(id)
    }

    fn group_ref(&self, group: GroupId) -> Result<&Group> {
        self.groups.get(&group).ok_or(Error::GroupNotFound(group))
    }

    fn group_mut(&mut self, group: GroupId) -> Result<&mut Group> {
        self.groups.get_mut(&group).ok_or(Error::GroupNotFound(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, env::testing::CountingEnv};

    fn manager() -> MlsManager<CountingEnv> {
        MlsManager::new(CountingEnv::default(), MlsConfig::default())
    }

    #[test]
    fn create_group_ids_are_distinct() {
        let mut mls = manager();
        let a = mls.create_group("a");
        let b = mls.create_group("b");
        assert_ne!(a, b);
        assert_eq!(mls.group_epoch(a), Some(1));
        assert_eq!(mls.group_name(b), Some("b"));
    }

    #[test]
    fn membership_changes_bump_epoch() {
        let mut mls = manager();
        let g = mls.create_group("g");
        assert_eq!(mls.add_member(g, "alice").unwrap(), 2);
        assert_eq!(mls.add_member(g, "bob").unwrap(), 3);
        assert_eq!(mls.remove_member(g, "alice").unwrap(), 4);
        assert_eq!(mls.members(g), Some(vec!["bob"]));
    }

    #[test]
    fn duplicate_add_is_state_error() {
        let mut mls = manager();
        let g = mls.create_group("g");
        mls.add_member(g, "alice").unwrap();

        let err = mls.add_member(g, "alice").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(mls.group_epoch(g), Some(2));
    }

    #[test]
    fn unknown_group_and_member_not_found() {
        let mut mls = manager();
        let missing = GroupId::from_u128(42);
        assert!(matches!(mls.add_member(missing, "a"), Err(Error::GroupNotFound(_))));

        let g = mls.create_group("g");
        assert!(matches!(mls.remove_member(g, "ghost"), Err(Error::MemberNotFound { .. })));
        assert!(matches!(
            mls.encrypt_group_message(g, "ghost", b"x"),
            Err(Error::MemberNotFound { .. })
        ));
    }

    #[test]
    fn envelope_carries_group_and_epoch() {
        let mut mls = manager();
        let g = mls.create_group("g");
        mls.add_member(g, "alice").unwrap();

        let env = mls.encrypt_group_message(g, "alice", b"hi").unwrap();
        assert_eq!(env.session_id, g.to_bytes());
        assert_eq!(env.associated_data, epoch_aad(g, 2));
        assert_eq!(env.sender_device_id, "alice");
        assert_eq!(env.message_index, 0);
    }

    #[test]
    fn retained_epoch_still_decrypts() {
        let mut mls = manager();
        let g = mls.create_group("g");
        mls.add_member(g, "alice").unwrap();
        mls.add_member(g, "bob").unwrap();

        let early = mls.encrypt_group_message(g, "alice", b"early").unwrap();
        mls.add_member(g, "carol").unwrap();

        assert_eq!(mls.decrypt_group_message(g, "bob", &early).unwrap(), b"early");
    }

    #[test]
    fn expired_epoch_is_mismatch() {
        let mut mls = MlsManager::new(CountingEnv::default(), MlsConfig { epoch_retention: 0 });
        let g = mls.create_group("g");
        mls.add_member(g, "alice").unwrap();
        mls.add_member(g, "bob").unwrap();

        let stale = mls.encrypt_group_message(g, "alice", b"stale").unwrap();
        mls.add_member(g, "carol").unwrap();

        let err = mls.decrypt_group_message(g, "bob", &stale).unwrap_err();
        assert!(matches!(err, Error::EpochMismatch { epoch: 3, current: 4 }));
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn relabelled_epoch_fails_authentication() {
        let mut mls = manager();
        let g = mls.create_group("g");
        mls.add_member(g, "alice").unwrap();
        let mut env = mls.encrypt_group_message(g, "alice", b"x").unwrap();
        mls.add_member(g, "bob").unwrap();

        env.associated_data = epoch_aad(g, 3).to_vec();
        assert!(matches!(mls.decrypt_group_message(g, "bob", &env), Err(Error::Crypto(_))));
    }

    #[test]
    fn import_reproduces_epoch_secret() {
        let mut mls = manager();
        let g = mls.create_group("g");
        mls.add_member(g, "alice").unwrap();
        mls.add_member(g, "bob").unwrap();
        let blob = mls.export_group(g).unwrap();

        let mut other = MlsManager::new(CountingEnv::default(), MlsConfig::default());
        assert_eq!(other.import_group(&blob).unwrap(), g);
        assert_eq!(other.epoch_secret(g), mls.epoch_secret(g));
        assert_eq!(other.members(g), mls.members(g));

        let env = mls.encrypt_group_message(g, "alice", b"shared").unwrap();
        assert_eq!(other.decrypt_group_message(g, "bob", &env).unwrap(), b"shared");
    }

    #[test]
    fn garbage_import_is_validation_error() {
        let mut mls = manager();
        let err = mls.import_group(&[0xFF, 0x00, 0x13]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

//! The single entry point the messaging UI talks to.
//!
//! Construct one [`SessionCoordinator`] at startup and share it behind an
//! `Arc`. Every call either returns ciphertext/plaintext or a
//! [`CryptoError`]; when there is no session the caller gets `NoSession`
//! and decides for itself whether to send in the clear.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::account::{IdentityAccount, PublicIdentity, PublishedPreKey};
use crate::config::EncryptionConfig;
use crate::group::{GroupMessage, GroupSessionKey, GroupSessionManager};
use crate::ids::{RemoteUserId, RoomId, SenderId};
use crate::pairwise::{PairwiseEnvelope, PairwiseSessionInfo, PairwiseSessionManager};
use crate::store::KeyStore;
use crate::CryptoError;

pub struct SessionCoordinator {
    account: Arc<IdentityAccount>,
    pairwise: PairwiseSessionManager,
    group: GroupSessionManager,
    /// Held shared by every operation and exclusively by `reset_all`.
    lifecycle: RwLock<()>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn KeyStore>, config: EncryptionConfig) -> Self {
        let account = Arc::new(IdentityAccount::new(Arc::clone(&store), config.clone()));
        Self {
            pairwise: PairwiseSessionManager::new(
                Arc::clone(&account),
                Arc::clone(&store),
                config.clone(),
            ),
            group: GroupSessionManager::new(store, config),
            account,
            lifecycle: RwLock::new(()),
        }
    }

    /// Load or create the device account. Safe to call repeatedly.
    pub fn initialize_encryption(&self) -> Result<PublicIdentity, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.account.initialize()?;
        self.account.public_identity()
    }

    pub fn is_initialized(&self) -> bool {
        self.account.is_initialized()
    }

    pub fn public_identity(&self) -> Result<PublicIdentity, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.account.public_identity()
    }

    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.account.fingerprint()
    }

    /// Top up the pre-key pool. Returns the keys to publish.
    pub fn generate_pre_keys(&self, count: usize) -> Result<Vec<PublishedPreKey>, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.account.generate_pre_keys(count)
    }

    pub fn needs_more_pre_keys(&self) -> Result<bool, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.account.needs_more_pre_keys()
    }

    // Direct messages

    pub fn create_outbound_session(
        &self,
        remote: &RemoteUserId,
        remote_identity_key: &[u8; 32],
        remote_pre_key: &PublishedPreKey,
    ) -> Result<PairwiseSessionInfo, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.pairwise
            .create_outbound(remote, remote_identity_key, remote_pre_key)
    }

    pub fn create_inbound_session(
        &self,
        remote: &RemoteUserId,
        envelope: &PairwiseEnvelope,
    ) -> Result<PairwiseSessionInfo, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.pairwise.create_inbound(remote, envelope)
    }

    pub fn send_direct_message(
        &self,
        remote: &RemoteUserId,
        plaintext: &[u8],
    ) -> Result<PairwiseEnvelope, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.require_account()?;
        self.pairwise.encrypt(remote, plaintext)
    }

    pub fn receive_direct_message(
        &self,
        remote: &RemoteUserId,
        envelope: &PairwiseEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.require_account()?;
        self.pairwise.decrypt(remote, envelope)
    }

    pub fn has_direct_session(&self, remote: &RemoteUserId) -> Result<bool, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.pairwise.has_session(remote)
    }

    pub fn direct_session_info(
        &self,
        remote: &RemoteUserId,
    ) -> Result<Option<PairwiseSessionInfo>, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.pairwise.session_info(remote)
    }

    pub fn reset_direct_session(&self, remote: &RemoteUserId) -> Result<(), CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.pairwise.reset_session(remote)
    }

    // Group messages

    /// Start (or restart) our sender-key session in `room`.
    pub fn create_group_session(
        &self,
        room: &RoomId,
    ) -> Result<(String, GroupSessionKey), CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.require_account()?;
        self.group.create_outbound_session(room)
    }

    pub fn rotate_group_session(
        &self,
        room: &RoomId,
    ) -> Result<(String, GroupSessionKey), CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.require_account()?;
        self.group.rotate_outbound_session(room)
    }

    pub fn group_session_key(&self, room: &RoomId) -> Result<GroupSessionKey, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.group.session_key(room)
    }

    pub fn needs_group_rotation(&self, room: &RoomId) -> Result<bool, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.group.needs_rotation(room)
    }

    /// Install a session key received from `sender` for `room`.
    pub fn add_group_session(
        &self,
        room: &RoomId,
        sender: &SenderId,
        session_key: &GroupSessionKey,
    ) -> Result<(), CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.require_account()?;
        self.group.create_inbound_session(room, sender, session_key)
    }

    pub fn reset_group_inbound(&self, room: &RoomId, sender: &SenderId) -> Result<(), CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.group.reset_inbound_session(room, sender)
    }

    pub fn send_group_message(
        &self,
        room: &RoomId,
        plaintext: &[u8],
    ) -> Result<GroupMessage, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.require_account()?;
        self.group.encrypt(room, plaintext)
    }

    pub fn receive_group_message(
        &self,
        room: &RoomId,
        sender: &SenderId,
        message: &GroupMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let _lifecycle = self.lifecycle.read();
        self.require_account()?;
        self.group.decrypt(room, sender, message)
    }

    /// Logout: wipe every session and the account, in memory and on disk.
    ///
    /// All three wipes are attempted even if one fails; the first error is
    /// returned so the caller can retry.
    pub fn reset_all(&self) -> Result<(), CryptoError> {
        let _lifecycle = self.lifecycle.write();
        let pairwise = self.pairwise.wipe();
        let group = self.group.wipe();
        let account = self.account.destroy();

        match (&pairwise, &group) {
            (Ok(pairwise), Ok(group)) => {
                tracing::info!(pairwise = *pairwise, group = *group, "encryption state wiped");
            }
            _ => tracing::warn!("encryption state wipe incomplete"),
        }
        pairwise?;
        group?;
        account
    }

    /// Message send/receive before `initialize_encryption` (or after
    /// `reset_all`) reports `NoSession`, never a silent fallback.
    fn require_account(&self) -> Result<(), CryptoError> {
        if self.account.is_initialized() {
            Ok(())
        } else {
            Err(CryptoError::NoSession("encryption not initialized".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::tests::FlakyStore;
    use crate::store::{
        group_outbound_key, pairwise_session_key, MemoryKeyStore, KEY_IDENTITY,
        KEY_PAIRWISE_INDEX,
    };

    fn coordinator() -> SessionCoordinator {
        let coordinator =
            SessionCoordinator::new(Arc::new(MemoryKeyStore::new()), EncryptionConfig::default());
        coordinator.initialize_encryption().unwrap();
        coordinator
    }

    #[test]
    fn uninitialized_reports_no_session() {
        let coordinator =
            SessionCoordinator::new(Arc::new(MemoryKeyStore::new()), EncryptionConfig::default());
        assert!(!coordinator.is_initialized());
        assert!(matches!(
            coordinator.send_direct_message(&"bob".into(), b"hi").unwrap_err(),
            CryptoError::NoSession(_)
        ));
        assert!(matches!(
            coordinator.send_group_message(&"room1".into(), b"hi").unwrap_err(),
            CryptoError::NoSession(_)
        ));
        assert!(matches!(
            coordinator.public_identity().unwrap_err(),
            CryptoError::NotInitialized
        ));
    }

    #[test]
    fn initialize_is_idempotent() {
        let coordinator = coordinator();
        let first = coordinator.public_identity().unwrap();
        let second = coordinator.initialize_encryption().unwrap();
        assert_eq!(first, second);
        assert_eq!(coordinator.fingerprint().unwrap(), hex::encode(first.identity_key));
    }

    #[test]
    fn reset_all_wipes_everything() {
        let alice = coordinator();
        let bob = coordinator();
        let bob_public = bob.public_identity().unwrap();
        alice
            .create_outbound_session(&"bob".into(), &bob_public.identity_key, &bob_public.pre_keys[0])
            .unwrap();
        alice.send_group_message(&"room1".into(), b"hello").unwrap();

        alice.reset_all().unwrap();
        assert!(!alice.is_initialized());
        assert!(matches!(
            alice.send_direct_message(&"bob".into(), b"hi").unwrap_err(),
            CryptoError::NoSession(_)
        ));

        alice.initialize_encryption().unwrap();
        assert!(matches!(
            alice.send_direct_message(&"bob".into(), b"hi").unwrap_err(),
            CryptoError::NoSession(_)
        ));
        assert!(!alice.has_direct_session(&"bob".into()).unwrap());
        assert!(matches!(
            alice.group_session_key(&"room1".into()).unwrap_err(),
            CryptoError::NoSession(_)
        ));
    }

    #[test]
    fn reset_all_after_failed_index_write_leaves_no_records() {
        let store = Arc::new(FlakyStore::new());
        let alice = SessionCoordinator::new(store.clone(), EncryptionConfig::default());
        alice.initialize_encryption().unwrap();
        let bob = coordinator();
        let bob_public = bob.public_identity().unwrap();

        store.fail_only(Some(KEY_PAIRWISE_INDEX));
        assert!(matches!(
            alice
                .create_outbound_session(&"bob".into(), &bob_public.identity_key, &bob_public.pre_keys[0])
                .unwrap_err(),
            CryptoError::StorageError(_)
        ));
        store.fail_only(None);

        alice
            .create_outbound_session(&"bob".into(), &bob_public.identity_key, &bob_public.pre_keys[1])
            .unwrap();
        alice.send_group_message(&"room/1".into(), b"hello").unwrap();
        alice.reset_all().unwrap();

        for key in [
            pairwise_session_key(&"bob".into()),
            group_outbound_key(&"room/1".into()),
            KEY_IDENTITY.to_string(),
            KEY_PAIRWISE_INDEX.to_string(),
        ] {
            assert!(store.get(&key).unwrap().is_none(), "{key} survived reset");
        }
    }
}

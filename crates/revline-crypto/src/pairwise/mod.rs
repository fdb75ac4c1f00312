//! One-to-one sessions: X3DH key agreement followed by a double ratchet.
//!
//! Per remote user the state machine is
//! `NoSession -> Established -> Established (ratcheted) -> Destroyed`.
//! Creating a session for a user who already has one replaces it.

pub mod session;
mod x3dh;

use std::sync::Arc;

use x25519_dalek::PublicKey as X25519Public;

use crate::account::{IdentityAccount, OneTimePreKey, PublishedPreKey};
use crate::config::EncryptionConfig;
use crate::identity;
use crate::ids::{PreKeyId, RemoteUserId};
use crate::store::{
    load_record, pairwise_session_key, save_record, KeyStore, RecordIndex, KEY_PAIRWISE_INDEX,
};
use crate::table::SessionTable;
use crate::CryptoError;

pub use session::{
    Handshake, MessageHeader, PairwiseEnvelope, PairwiseSessionInfo, SessionRole,
};
use session::{PairwiseSession, SkipLimits};

pub struct PairwiseSessionManager {
    account: Arc<IdentityAccount>,
    store: Arc<dyn KeyStore>,
    config: EncryptionConfig,
    sessions: SessionTable<RemoteUserId, PairwiseSession>,
    index: RecordIndex,
}

impl PairwiseSessionManager {
    pub fn new(
        account: Arc<IdentityAccount>,
        store: Arc<dyn KeyStore>,
        config: EncryptionConfig,
    ) -> Self {
        Self {
            account,
            store,
            config,
            sessions: SessionTable::new(),
            index: RecordIndex::new(KEY_PAIRWISE_INDEX),
        }
    }

    fn limits(&self) -> SkipLimits {
        SkipLimits {
            max_skip: self.config.max_skip,
            max_stored: self.config.max_stored_skipped_keys,
        }
    }

    /// Start a session with `remote` from their published key material.
    ///
    /// Replaces any previous session with the same user.
    pub fn create_outbound(
        &self,
        remote: &RemoteUserId,
        remote_identity_key: &[u8; 32],
        remote_pre_key: &PublishedPreKey,
    ) -> Result<PairwiseSessionInfo, CryptoError> {
        remote_pre_key.verify(remote_identity_key)?;
        let (local_secret, local_identity) = self.account.identity_keys()?;
        let remote_identity = identity::agreement_key(remote_identity_key)?;

        let (shared_secret, ephemeral_key) = x3dh::initiate(
            &local_secret,
            &remote_identity,
            &X25519Public::from(remote_pre_key.public_key),
        )?;
        let session = PairwiseSession::initiator(
            remote.clone(),
            &shared_secret,
            associated_data(&local_identity, remote_identity_key),
            remote_pre_key.public_key,
            Handshake {
                identity_key: local_identity,
                ephemeral_key,
                pre_key_id: remote_pre_key.id,
            },
            timestamp_now(),
        )?;

        let entry = self.sessions.entry(remote);
        let mut guard = entry.lock();
        self.persist_new(remote, &session)?;
        let info = session.info();
        *guard = Some(session);

        tracing::info!(user = %remote, pre_key = remote_pre_key.id, "outbound pairwise session created");
        Ok(info)
    }

    /// Accept a session started by `remote`, consuming the referenced pre-key.
    ///
    /// Fails with `HandshakeError` if the envelope carries no handshake or
    /// the pre-key cannot be consumed. The session is stored before the
    /// pre-key is consumed; if either write fails, both are left as they were.
    pub fn create_inbound(
        &self,
        remote: &RemoteUserId,
        envelope: &PairwiseEnvelope,
    ) -> Result<PairwiseSessionInfo, CryptoError> {
        let handshake = envelope
            .handshake
            .as_ref()
            .ok_or_else(|| CryptoError::HandshakeError("not a pre-key message".into()))?;

        let entry = self.sessions.entry(remote);
        let mut guard = entry.lock();
        self.load_into(remote, &mut guard)?;

        let pre_key = self
            .account
            .peek_pre_key(handshake.pre_key_id)
            .map_err(reject_pre_key)?;
        let session = self.respond(remote, handshake, &pre_key, envelope)?;
        self.install_inbound(remote, guard.as_ref(), &session, handshake.pre_key_id)?;
        let info = session.info();
        *guard = Some(session);

        tracing::info!(user = %remote, pre_key = handshake.pre_key_id, "inbound pairwise session created");
        Ok(info)
    }

    /// Encrypt for `remote`, ratcheting the sending chain one step.
    pub fn encrypt(
        &self,
        remote: &RemoteUserId,
        plaintext: &[u8],
    ) -> Result<PairwiseEnvelope, CryptoError> {
        let entry = self.sessions.entry(remote);
        let mut guard = entry.lock();
        self.load_into(remote, &mut guard)?;

        let mut session = guard
            .as_ref()
            .ok_or_else(|| CryptoError::NoSession(format!("no pairwise session with {remote}")))?
            .clone();
        let envelope = session.encrypt(plaintext)?;
        save_record(&*self.store, &pairwise_session_key(remote), &session)?;
        *guard = Some(session);

        tracing::debug!(user = %remote, index = envelope.step_index(), "pairwise message encrypted");
        Ok(envelope)
    }

    /// Decrypt a message from `remote`.
    ///
    /// A pre-key message for which no matching inbound session exists
    /// establishes one first. The pre-key is consumed only once the message
    /// has authenticated, so a forged handshake cannot burn it.
    pub fn decrypt(
        &self,
        remote: &RemoteUserId,
        envelope: &PairwiseEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        let entry = self.sessions.entry(remote);
        let mut guard = entry.lock();
        self.load_into(remote, &mut guard)?;

        if let Some(handshake) = &envelope.handshake {
            let known = guard
                .as_ref()
                .is_some_and(|session| session.was_created_by(handshake));
            if !known {
                let pre_key = self
                    .account
                    .peek_pre_key(handshake.pre_key_id)
                    .map_err(reject_pre_key)?;
                let mut session = self.respond(remote, handshake, &pre_key, envelope)?;
                let plaintext = session.decrypt(envelope, self.limits()).inspect_err(|e| {
                    tracing::warn!(user = %remote, error = %e, "rejected pre-key message");
                })?;
                self.install_inbound(remote, guard.as_ref(), &session, handshake.pre_key_id)?;
                *guard = Some(session);

                tracing::info!(user = %remote, pre_key = handshake.pre_key_id, "inbound pairwise session created from message");
                return Ok(plaintext);
            }
        }

        let mut session = guard
            .as_ref()
            .ok_or_else(|| CryptoError::NoSession(format!("no pairwise session with {remote}")))?
            .clone();
        let plaintext = session.decrypt(envelope, self.limits()).inspect_err(|e| {
            tracing::warn!(user = %remote, index = envelope.step_index(), error = %e, "pairwise message rejected");
        })?;
        save_record(&*self.store, &pairwise_session_key(remote), &session)?;
        *guard = Some(session);

        tracing::debug!(user = %remote, index = envelope.step_index(), "pairwise message decrypted");
        Ok(plaintext)
    }

    pub fn has_session(&self, remote: &RemoteUserId) -> Result<bool, CryptoError> {
        Ok(self.session_info(remote)?.is_some())
    }

    pub fn session_info(
        &self,
        remote: &RemoteUserId,
    ) -> Result<Option<PairwiseSessionInfo>, CryptoError> {
        let entry = self.sessions.entry(remote);
        let mut guard = entry.lock();
        self.load_into(remote, &mut guard)?;
        Ok(guard.as_ref().map(PairwiseSession::info))
    }

    /// Destroy the session with `remote`.
    pub fn reset_session(&self, remote: &RemoteUserId) -> Result<(), CryptoError> {
        let entry = self.sessions.entry(remote);
        let mut guard = entry.lock();
        let key = pairwise_session_key(remote);
        self.store.delete(&key)?;
        self.index.remove(&*self.store, &key)?;
        *guard = None;

        tracing::info!(user = %remote, "pairwise session reset");
        Ok(())
    }

    /// Delete every pairwise session from storage and memory.
    pub(crate) fn wipe(&self) -> Result<usize, CryptoError> {
        self.sessions.clear();
        self.index.wipe(&*self.store)
    }

    fn respond(
        &self,
        remote: &RemoteUserId,
        handshake: &Handshake,
        pre_key: &OneTimePreKey,
        envelope: &PairwiseEnvelope,
    ) -> Result<PairwiseSession, CryptoError> {
        let (local_secret, local_identity) = self.account.identity_keys()?;
        let remote_identity = identity::agreement_key(&handshake.identity_key)
            .map_err(|e| CryptoError::HandshakeError(e.to_string()))?;

        let shared_secret = x3dh::respond(
            &local_secret,
            pre_key.secret(),
            &remote_identity,
            &X25519Public::from(handshake.ephemeral_key),
        )?;
        PairwiseSession::responder(
            remote.clone(),
            &shared_secret,
            associated_data(&handshake.identity_key, &local_identity),
            pre_key.secret(),
            handshake.clone(),
            envelope.header.ratchet_key,
            timestamp_now(),
        )
    }

    fn load_into(
        &self,
        remote: &RemoteUserId,
        slot: &mut Option<PairwiseSession>,
    ) -> Result<(), CryptoError> {
        if slot.is_none() {
            *slot = load_record(&*self.store, &pairwise_session_key(remote))?;
        }
        Ok(())
    }

    /// The index entry goes in before the record so `wipe` can always find it.
    fn persist_new(&self, remote: &RemoteUserId, session: &PairwiseSession) -> Result<(), CryptoError> {
        let key = pairwise_session_key(remote);
        self.index.insert(&*self.store, &key)?;
        save_record(&*self.store, &key, session)
    }

    /// Store a responder session, then consume its pre-key. If the consume
    /// fails, the stored record goes back to `previous`.
    fn install_inbound(
        &self,
        remote: &RemoteUserId,
        previous: Option<&PairwiseSession>,
        session: &PairwiseSession,
        pre_key_id: PreKeyId,
    ) -> Result<(), CryptoError> {
        self.persist_new(remote, session)?;
        if let Err(e) = self.account.consume_pre_key(pre_key_id) {
            if let Err(restore) = self.restore_record(remote, previous) {
                tracing::warn!(user = %remote, error = %restore, "could not restore pairwise session record");
            }
            return Err(reject_pre_key(e));
        }
        Ok(())
    }

    fn restore_record(
        &self,
        remote: &RemoteUserId,
        previous: Option<&PairwiseSession>,
    ) -> Result<(), CryptoError> {
        let key = pairwise_session_key(remote);
        match previous {
            Some(session) => save_record(&*self.store, &key, session),
            None => {
                self.store.delete(&key)?;
                self.index.remove(&*self.store, &key)
            }
        }
    }
}

fn associated_data(initiator: &[u8; 32], responder: &[u8; 32]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator);
    ad.extend_from_slice(responder);
    ad
}

fn reject_pre_key(e: CryptoError) -> CryptoError {
    match e {
        CryptoError::KeyNotFound(what) => {
            CryptoError::HandshakeError(format!("{what} unavailable (replayed or stale handshake)"))
        }
        other => other,
    }
}

fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

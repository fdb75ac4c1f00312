//! Group messaging with sender keys.
//!
//! The local device keeps one outbound session per room and one inbound
//! session per (room, sender). Session keys travel to room members over
//! pairwise sessions or another channel outside this crate.

pub mod session;

use std::sync::Arc;

use crate::config::EncryptionConfig;
use crate::ids::{InboundGroupKey, RoomId, SenderId};
use crate::store::{
    group_inbound_key, group_outbound_key, load_record, save_record, KeyStore, RecordIndex,
    KEY_GROUP_INDEX,
};
use crate::table::SessionTable;
use crate::CryptoError;

pub use session::{GroupMessage, GroupSessionKey};
use session::{InboundGroupSession, OutboundGroupSession};

pub struct GroupSessionManager {
    store: Arc<dyn KeyStore>,
    config: EncryptionConfig,
    outbound: SessionTable<RoomId, OutboundGroupSession>,
    inbound: SessionTable<InboundGroupKey, InboundGroupSession>,
    index: RecordIndex,
}

impl GroupSessionManager {
    pub fn new(store: Arc<dyn KeyStore>, config: EncryptionConfig) -> Self {
        Self {
            store,
            config,
            outbound: SessionTable::new(),
            inbound: SessionTable::new(),
            index: RecordIndex::new(KEY_GROUP_INDEX),
        }
    }

    /// Start a fresh outbound session for `room`, replacing any existing one.
    ///
    /// Returns the session id and the key to distribute to room members.
    pub fn create_outbound_session(
        &self,
        room: &RoomId,
    ) -> Result<(String, GroupSessionKey), CryptoError> {
        let entry = self.outbound.entry(room);
        let mut guard = entry.lock();
        let session = self.new_outbound(room)?;
        let result = (session.session_id(), session.session_key());
        *guard = Some(session);

        tracing::info!(room = %room, session_id = %result.0, "outbound group session created");
        Ok(result)
    }

    /// Discard the outbound session for `room` and start a new one.
    ///
    /// Call whenever room membership shrinks.
    pub fn rotate_outbound_session(
        &self,
        room: &RoomId,
    ) -> Result<(String, GroupSessionKey), CryptoError> {
        let entry = self.outbound.entry(room);
        let mut guard = entry.lock();
        self.load_outbound(room, &mut guard)?;
        let previous = guard.as_ref().map(OutboundGroupSession::session_id);

        let session = self.new_outbound(room)?;
        let result = (session.session_id(), session.session_key());
        *guard = Some(session);

        tracing::info!(
            room = %room,
            previous = previous.as_deref().unwrap_or("none"),
            session_id = %result.0,
            "outbound group session rotated"
        );
        Ok(result)
    }

    /// Current outbound key for `room`, e.g. for a member who just joined.
    /// Does not advance the ratchet.
    pub fn session_key(&self, room: &RoomId) -> Result<GroupSessionKey, CryptoError> {
        let entry = self.outbound.entry(room);
        let mut guard = entry.lock();
        self.load_outbound(room, &mut guard)?;
        guard
            .as_ref()
            .map(OutboundGroupSession::session_key)
            .ok_or_else(|| CryptoError::NoSession(format!("no outbound group session in {room}")))
    }

    pub fn outbound_session_id(&self, room: &RoomId) -> Result<Option<String>, CryptoError> {
        let entry = self.outbound.entry(room);
        let mut guard = entry.lock();
        self.load_outbound(room, &mut guard)?;
        Ok(guard.as_ref().map(OutboundGroupSession::session_id))
    }

    /// Whether the outbound session for `room` has hit its message or age
    /// limit. Rotation itself is left to the caller.
    pub fn needs_rotation(&self, room: &RoomId) -> Result<bool, CryptoError> {
        let entry = self.outbound.entry(room);
        let mut guard = entry.lock();
        self.load_outbound(room, &mut guard)?;
        Ok(guard
            .as_ref()
            .is_some_and(|session| session.needs_rotation(&self.config, timestamp_now())))
    }

    /// Encrypt for `room`, creating the outbound session on first use.
    pub fn encrypt(&self, room: &RoomId, plaintext: &[u8]) -> Result<GroupMessage, CryptoError> {
        let entry = self.outbound.entry(room);
        let mut guard = entry.lock();
        self.load_outbound(room, &mut guard)?;

        let mut session = match guard.as_ref() {
            Some(session) => session.clone(),
            None => {
                let session = self.new_outbound(room)?;
                tracing::info!(room = %room, session_id = %session.session_id(), "outbound group session created lazily");
                session
            }
        };
        let message = session.encrypt(plaintext)?;
        save_record(&*self.store, &group_outbound_key(room), &session)?;
        *guard = Some(session);

        tracing::debug!(room = %room, index = message.index, "group message encrypted");
        Ok(message)
    }

    /// Install the session key `sender` shared for `room`.
    ///
    /// Supplying the same session again is a no-op. A different session for
    /// an initialized (room, sender) pair fails with `SessionConflict` until
    /// [`Self::reset_inbound_session`] is called.
    pub fn create_inbound_session(
        &self,
        room: &RoomId,
        sender: &SenderId,
        session_key: &GroupSessionKey,
    ) -> Result<(), CryptoError> {
        let key = InboundGroupKey::new(room.clone(), sender.clone());
        let entry = self.inbound.entry(&key);
        let mut guard = entry.lock();
        self.load_inbound(&key, &mut guard)?;

        let session_id = session_key.session_id();
        if let Some(existing) = guard.as_ref() {
            if existing.session_id() == session_id {
                tracing::debug!(room = %room, sender = %sender, %session_id, "inbound group session already present");
                return Ok(());
            }
            tracing::warn!(room = %room, sender = %sender, %session_id, "conflicting group session key");
            return Err(CryptoError::SessionConflict(format!(
                "{key} already has session {}",
                existing.session_id()
            )));
        }

        let session = InboundGroupSession::from_key(room.clone(), session_key)?;
        let record = group_inbound_key(&key);
        self.index.insert(&*self.store, &record)?;
        save_record(&*self.store, &record, &session)?;
        *guard = Some(session);

        tracing::info!(room = %room, sender = %sender, %session_id, first_index = session_key.index(), "inbound group session created");
        Ok(())
    }

    /// Decrypt a message from `sender` in `room`.
    ///
    /// Fails with `Replay` for any index at or below the highest one already
    /// decrypted for this sender.
    pub fn decrypt(
        &self,
        room: &RoomId,
        sender: &SenderId,
        message: &GroupMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = InboundGroupKey::new(room.clone(), sender.clone());
        let entry = self.inbound.entry(&key);
        let mut guard = entry.lock();
        self.load_inbound(&key, &mut guard)?;

        let mut session = guard
            .as_ref()
            .ok_or_else(|| CryptoError::NoSession(format!("no inbound group session for {key}")))?
            .clone();
        let plaintext = session
            .decrypt(message, self.config.max_skip)
            .inspect_err(|e| {
                tracing::warn!(room = %room, sender = %sender, index = message.index, error = %e, "group message rejected");
            })?;
        save_record(&*self.store, &group_inbound_key(&key), &session)?;
        *guard = Some(session);

        tracing::debug!(room = %room, sender = %sender, index = message.index, "group message decrypted");
        Ok(plaintext)
    }

    pub fn has_inbound_session(&self, room: &RoomId, sender: &SenderId) -> Result<bool, CryptoError> {
        let key = InboundGroupKey::new(room.clone(), sender.clone());
        let entry = self.inbound.entry(&key);
        let mut guard = entry.lock();
        self.load_inbound(&key, &mut guard)?;
        Ok(guard.is_some())
    }

    /// Forget the inbound session for (room, sender) so a new key can be
    /// installed.
    pub fn reset_inbound_session(&self, room: &RoomId, sender: &SenderId) -> Result<(), CryptoError> {
        let key = InboundGroupKey::new(room.clone(), sender.clone());
        let entry = self.inbound.entry(&key);
        let mut guard = entry.lock();
        let record = group_inbound_key(&key);
        self.store.delete(&record)?;
        self.index.remove(&*self.store, &record)?;
        *guard = None;

        tracing::info!(room = %room, sender = %sender, "inbound group session reset");
        Ok(())
    }

    /// Delete every group session from storage and memory.
    pub(crate) fn wipe(&self) -> Result<usize, CryptoError> {
        self.outbound.clear();
        self.inbound.clear();
        self.index.wipe(&*self.store)
    }

    /// Build and persist a new outbound session. The caller holds the slot.
    ///
    /// The index entry is written first so a wipe always finds the record.
    fn new_outbound(&self, room: &RoomId) -> Result<OutboundGroupSession, CryptoError> {
        let session = OutboundGroupSession::new(room.clone(), timestamp_now());
        let record = group_outbound_key(room);
        self.index.insert(&*self.store, &record)?;
        save_record(&*self.store, &record, &session)?;
        tracing::debug!(room = %room, index = session.index(), "persisted outbound group session");
        Ok(session)
    }

    fn load_outbound(
        &self,
        room: &RoomId,
        slot: &mut Option<OutboundGroupSession>,
    ) -> Result<(), CryptoError> {
        if slot.is_none() {
            *slot = load_record(&*self.store, &group_outbound_key(room))?;
        }
        Ok(())
    }

    fn load_inbound(
        &self,
        key: &InboundGroupKey,
        slot: &mut Option<InboundGroupSession>,
    ) -> Result<(), CryptoError> {
        if slot.is_none() {
            *slot = load_record(&*self.store, &group_inbound_key(key))?;
        }
        Ok(())
    }
}

fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

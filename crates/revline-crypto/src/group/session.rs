//! Sender-key sessions: one outbound ratchet per room, one inbound ratchet
//! per (room, sender).
//!
//! Every outbound session owns an Ed25519 signing key whose public half is
//! the session id. Messages are AES-256-GCM under the chain's message key
//! and signed, so a room member holding the chain key still cannot forge
//! messages as another sender.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::EncryptionConfig;
use crate::ids::RoomId;
use crate::ratchet::ChainKey;
use crate::CryptoError;

const EXPORT_LEN: usize = 4 + 32 + 32 + 64;

/// Exported state of an outbound session, shared with room members so
/// they can decrypt from `index` onwards.
///
/// Wire form: `index (u32 LE) || chain key || signing public key || signature`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupSessionKey {
    index: u32,
    chain_key: [u8; 32],
    signing_key: [u8; 32],
    signature: Vec<u8>,
}

impl GroupSessionKey {
    /// Hex of the sender's signing public key.
    pub fn session_id(&self) -> String {
        hex::encode(self.signing_key)
    }

    /// First message index this key can decrypt.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signed_part();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse an exported key. The signature is checked by [`Self::verify`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != EXPORT_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "group session key must be {EXPORT_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut index = [0u8; 4];
        let mut chain_key = [0u8; 32];
        let mut signing_key = [0u8; 32];
        index.copy_from_slice(&bytes[..4]);
        chain_key.copy_from_slice(&bytes[4..36]);
        signing_key.copy_from_slice(&bytes[36..68]);
        Ok(Self {
            index: u32::from_le_bytes(index),
            chain_key,
            signing_key,
            signature: bytes[68..].to_vec(),
        })
    }

    /// Check that the key was exported by the holder of its signing key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        verify_signature(&self.signing_key, &self.signed_part(), &self.signature)
            .map_err(|_| CryptoError::InvalidKey("group session key signature mismatch".into()))
    }

    fn signed_part(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EXPORT_LEN);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.chain_key);
        out.extend_from_slice(&self.signing_key);
        out
    }
}

impl std::fmt::Debug for GroupSessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSessionKey")
            .field("session_id", &self.session_id())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// An encrypted group message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub session_id: String,
    /// Ratchet index the message was encrypted at.
    pub index: u32,
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over `index || ciphertext`.
    pub signature: Vec<u8>,
}

impl GroupMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self)
            .map_err(|e| CryptoError::EncryptionError(format!("encode group message: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::DecryptionError(format!("malformed group message: {e}")))
    }

    fn signed_part(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.ciphertext.len());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// Associated data for a group message: the room and session it belongs to.
fn message_aad(room: &RoomId, session_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(room.as_str().len() + 1 + session_id.len());
    aad.extend_from_slice(room.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(session_id.as_bytes());
    aad
}

fn verify_signature(public_key: &[u8; 32], msg: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKey(format!("signing key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| CryptoError::InvalidKey(format!("signature: {e}")))?;
    key.verify(msg, &signature)
        .map_err(|_| CryptoError::DecryptionError("bad signature".into()))
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct OutboundGroupSession {
    room: RoomId,
    signing_secret: [u8; 32],
    chain: ChainKey,
    created_at: u64,
    messages_sent: u32,
}

impl Drop for OutboundGroupSession {
    fn drop(&mut self) {
        self.signing_secret.zeroize();
    }
}

impl OutboundGroupSession {
    pub(crate) fn new(room: RoomId, created_at: u64) -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let mut chain_key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut chain_key);
        let session = Self {
            room,
            signing_secret: signing.to_bytes(),
            chain: ChainKey::new(chain_key, 0),
            created_at,
            messages_sent: 0,
        };
        chain_key.zeroize();
        session
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.signing_secret)
    }

    pub(crate) fn session_id(&self) -> String {
        hex::encode(self.signing_key().verifying_key().to_bytes())
    }

    pub(crate) fn index(&self) -> u32 {
        self.chain.index()
    }

    /// Export the chain at its current position without advancing it.
    pub(crate) fn session_key(&self) -> GroupSessionKey {
        let signing = self.signing_key();
        let mut key = GroupSessionKey {
            index: self.chain.index(),
            chain_key: *self.chain.key_bytes(),
            signing_key: signing.verifying_key().to_bytes(),
            signature: Vec::new(),
        };
        key.signature = signing.sign(&key.signed_part()).to_bytes().to_vec();
        key
    }

    /// Whether the configured message count or age has been reached.
    pub(crate) fn needs_rotation(&self, config: &EncryptionConfig, now: u64) -> bool {
        self.messages_sent >= config.group_rotation_messages
            || now.saturating_sub(self.created_at) >= config.group_rotation_period_secs
    }

    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<GroupMessage, CryptoError> {
        let session_id = self.session_id();
        let message_key = self.chain.next_message_key()?;
        let ciphertext = message_key.seal(plaintext, &message_aad(&self.room, &session_id))?;

        let mut message = GroupMessage {
            session_id,
            index: message_key.index(),
            ciphertext,
            signature: Vec::new(),
        };
        message.signature = self
            .signing_key()
            .sign(&message.signed_part())
            .to_bytes()
            .to_vec();
        self.messages_sent = self.messages_sent.saturating_add(1);
        Ok(message)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct InboundGroupSession {
    room: RoomId,
    signing_key: [u8; 32],
    first_index: u32,
    /// Positioned at the next index that may still be decrypted.
    chain: ChainKey,
    highest_consumed: Option<u32>,
}

impl InboundGroupSession {
    pub(crate) fn from_key(room: RoomId, key: &GroupSessionKey) -> Result<Self, CryptoError> {
        key.verify()?;
        Ok(Self {
            room,
            signing_key: key.signing_key,
            first_index: key.index,
            chain: ChainKey::new(key.chain_key, key.index),
            highest_consumed: None,
        })
    }

    pub(crate) fn session_id(&self) -> String {
        hex::encode(self.signing_key)
    }

    /// Decrypt in place, moving the chain past `message.index`.
    ///
    /// Only indices above everything consumed so far are accepted. The
    /// caller works on a copy and keeps it only on success.
    pub(crate) fn decrypt(
        &mut self,
        message: &GroupMessage,
        max_skip: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let session_id = self.session_id();
        if message.session_id != session_id {
            return Err(CryptoError::KeyNotFound(format!(
                "group session {}",
                message.session_id
            )));
        }
        if message.index < self.first_index {
            return Err(CryptoError::Replay(format!(
                "index {} precedes session start {}",
                message.index, self.first_index
            )));
        }
        if let Some(highest) = self.highest_consumed {
            if message.index <= highest {
                return Err(CryptoError::Replay(format!(
                    "index {} already consumed (highest {highest})",
                    message.index
                )));
            }
        }
        let gap = message.index - self.chain.index();
        if gap > max_skip {
            return Err(CryptoError::RatchetExhausted(format!(
                "message is {gap} steps ahead, window is {max_skip}"
            )));
        }

        verify_signature(&self.signing_key, &message.signed_part(), &message.signature)?;

        while self.chain.index() < message.index {
            self.chain.advance()?;
        }
        let message_key = self.chain.next_message_key()?;
        let plaintext = message_key.open(&message.ciphertext, &message_aad(&self.room, &session_id))?;
        self.highest_consumed = Some(message.index);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (OutboundGroupSession, InboundGroupSession) {
        let outbound = OutboundGroupSession::new("room1".into(), 0);
        let inbound = InboundGroupSession::from_key("room1".into(), &outbound.session_key()).unwrap();
        (outbound, inbound)
    }

    #[test]
    fn session_key_round_trips_through_bytes() {
        let outbound = OutboundGroupSession::new("room1".into(), 0);
        let key = outbound.session_key();
        let parsed = GroupSessionKey::from_bytes(&key.to_bytes()).unwrap();
        parsed.verify().unwrap();
        assert_eq!(parsed.session_id(), outbound.session_id());
        assert_eq!(parsed.index(), 0);
    }

    #[test]
    fn tampered_session_key_is_rejected() {
        let outbound = OutboundGroupSession::new("room1".into(), 0);
        let mut bytes = outbound.session_key().to_bytes();
        bytes[10] ^= 0x01;
        let key = GroupSessionKey::from_bytes(&bytes).unwrap();
        assert!(matches!(key.verify().unwrap_err(), CryptoError::InvalidKey(_)));
        assert!(GroupSessionKey::from_bytes(&bytes[..100]).is_err());
    }

    #[test]
    fn forward_only_consumption() {
        let (mut outbound, mut inbound) = pair();
        let m0 = outbound.encrypt(b"hi room").unwrap();
        let m1 = outbound.encrypt(b"second").unwrap();
        let m2 = outbound.encrypt(b"third").unwrap();

        assert_eq!(inbound.decrypt(&m0, 10).unwrap(), b"hi room");
        assert!(matches!(inbound.decrypt(&m0, 10).unwrap_err(), CryptoError::Replay(_)));
        assert_eq!(inbound.decrypt(&m2, 10).unwrap(), b"third");
        assert!(matches!(inbound.decrypt(&m1, 10).unwrap_err(), CryptoError::Replay(_)));
        assert_eq!(inbound.highest_consumed, Some(2));
    }

    #[test]
    fn late_joiner_cannot_read_earlier_messages() {
        let mut outbound = OutboundGroupSession::new("room1".into(), 0);
        let early = outbound.encrypt(b"before you joined").unwrap();
        let mut inbound =
            InboundGroupSession::from_key("room1".into(), &outbound.session_key()).unwrap();
        let late = outbound.encrypt(b"welcome").unwrap();

        assert!(matches!(inbound.decrypt(&early, 10).unwrap_err(), CryptoError::Replay(_)));
        assert_eq!(inbound.decrypt(&late, 10).unwrap(), b"welcome");
    }

    #[test]
    fn skip_window_is_bounded() {
        let (mut outbound, mut inbound) = pair();
        let mut last = None;
        for _ in 0..6 {
            last = Some(outbound.encrypt(b"x").unwrap());
        }
        let last = last.unwrap();
        assert!(matches!(
            inbound.decrypt(&last, 4).unwrap_err(),
            CryptoError::RatchetExhausted(_)
        ));
        assert_eq!(inbound.decrypt(&last, 5).unwrap(), b"x");
    }

    #[test]
    fn forged_or_tampered_messages_are_rejected() {
        let (mut outbound, mut inbound) = pair();
        let message = outbound.encrypt(b"meet at the track").unwrap();

        let mut tampered = message.clone();
        tampered.ciphertext[0] ^= 0x01;
        assert!(matches!(
            inbound.decrypt(&tampered, 10).unwrap_err(),
            CryptoError::DecryptionError(_)
        ));

        let mut foreign = message.clone();
        foreign.session_id = OutboundGroupSession::new("room1".into(), 0).session_id();
        assert!(matches!(
            inbound.decrypt(&foreign, 10).unwrap_err(),
            CryptoError::KeyNotFound(_)
        ));

        assert_eq!(inbound.decrypt(&message, 10).unwrap(), b"meet at the track");
    }

    #[test]
    fn message_bound_to_room() {
        let mut outbound = OutboundGroupSession::new("room1".into(), 0);
        let mut elsewhere =
            InboundGroupSession::from_key("room2".into(), &outbound.session_key()).unwrap();
        let message = outbound.encrypt(b"room1 only").unwrap();
        assert!(matches!(
            elsewhere.decrypt(&message, 10).unwrap_err(),
            CryptoError::DecryptionError(_)
        ));
    }

    #[test]
    fn rotation_threshold() {
        let config = EncryptionConfig {
            group_rotation_messages: 2,
            group_rotation_period_secs: 100,
            ..EncryptionConfig::default()
        };
        let mut outbound = OutboundGroupSession::new("room1".into(), 1_000);
        assert!(!outbound.needs_rotation(&config, 1_000));
        assert!(outbound.needs_rotation(&config, 1_100));

        outbound.encrypt(b"a").unwrap();
        outbound.encrypt(b"b").unwrap();
        assert!(outbound.needs_rotation(&config, 1_000));
    }
}

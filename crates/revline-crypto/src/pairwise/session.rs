//! Double-ratchet state for one pairwise conversation.

use std::collections::VecDeque;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::ids::{PreKeyId, RemoteUserId};
use crate::ratchet::{ChainKey, MessageKey};
use crate::CryptoError;

const ROOT_KEY_INFO: &[u8] = b"RevlineRatchet";

/// Key-agreement data the initiator attaches until the responder replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Initiator's Ed25519 identity key.
    pub identity_key: [u8; 32],
    /// Initiator's X25519 ephemeral key.
    pub ephemeral_key: [u8; 32],
    /// Which of the responder's one-time pre-keys was used.
    pub pre_key_id: PreKeyId,
}

/// Ratchet position of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current X25519 ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// Step index within the current sending chain.
    pub index: u32,
}

/// A pairwise message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseEnvelope {
    /// Present on pre-key messages, i.e. before the responder has replied.
    pub handshake: Option<Handshake>,
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}

impl PairwiseEnvelope {
    pub fn is_pre_key_message(&self) -> bool {
        self.handshake.is_some()
    }

    /// Ratchet step index this message was encrypted at.
    pub fn step_index(&self) -> u32 {
        self.header.index
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self).map_err(|e| CryptoError::EncryptionError(format!("encode envelope: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::DecryptionError(format!("malformed envelope: {e}")))
    }

    /// Header bytes bound into the AEAD tag.
    fn authenticated_header(&self, associated_data: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(associated_data.len() + 40 + 68);
        aad.extend_from_slice(associated_data);
        aad.extend_from_slice(&self.header.ratchet_key);
        aad.extend_from_slice(&self.header.previous_chain_length.to_le_bytes());
        aad.extend_from_slice(&self.header.index.to_le_bytes());
        if let Some(handshake) = &self.handshake {
            aad.extend_from_slice(&handshake.identity_key);
            aad.extend_from_slice(&handshake.ephemeral_key);
            aad.extend_from_slice(&handshake.pre_key_id.to_le_bytes());
        }
        aad
    }
}

/// Which side of the key agreement this device played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Public view of a pairwise session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairwiseSessionInfo {
    pub remote: RemoteUserId,
    pub role: SessionRole,
    /// Unix seconds.
    pub created_at: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Still attaching the handshake to outgoing messages.
    pub awaiting_reply: bool,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    key: MessageKey,
}

/// Skip window limits applied while catching up a receiving chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SkipLimits {
    pub max_skip: u32,
    pub max_stored: usize,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct PairwiseSession {
    remote: RemoteUserId,
    role: SessionRole,
    created_at: u64,
    /// Initiator identity key followed by responder identity key.
    associated_data: Vec<u8>,
    root_key: [u8; 32],
    ratchet_secret: [u8; 32],
    remote_ratchet_key: Option<[u8; 32]>,
    sending: Option<ChainKey>,
    receiving: Option<ChainKey>,
    previous_sending_length: u32,
    skipped: VecDeque<SkippedKey>,
    pending_handshake: Option<Handshake>,
    inbound_handshake: Option<Handshake>,
    messages_sent: u64,
    messages_received: u64,
}

impl Drop for PairwiseSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.ratchet_secret.zeroize();
    }
}

impl PairwiseSession {
    /// Initiator state: the first sending chain is keyed against the
    /// responder's pre-key, which doubles as its first ratchet key.
    pub(crate) fn initiator(
        remote: RemoteUserId,
        shared_secret: &[u8; 32],
        associated_data: Vec<u8>,
        remote_pre_key: [u8; 32],
        handshake: Handshake,
        created_at: u64,
    ) -> Result<Self, CryptoError> {
        let ratchet_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dh = ratchet_secret.diffie_hellman(&X25519Public::from(remote_pre_key));
        let (root_key, sending) = kdf_root(shared_secret, dh.as_bytes())?;

        Ok(Self {
            remote,
            role: SessionRole::Initiator,
            created_at,
            associated_data,
            root_key,
            ratchet_secret: ratchet_secret.to_bytes(),
            remote_ratchet_key: Some(remote_pre_key),
            sending: Some(ChainKey::new(sending, 0)),
            receiving: None,
            previous_sending_length: 0,
            skipped: VecDeque::new(),
            pending_handshake: Some(handshake),
            inbound_handshake: None,
            messages_sent: 0,
            messages_received: 0,
        })
    }

    /// Responder state: the consumed pre-key is our first ratchet key, and
    /// the initiator's first ratchet key is applied right away so that we
    /// can send before having decrypted anything.
    pub(crate) fn responder(
        remote: RemoteUserId,
        shared_secret: &[u8; 32],
        associated_data: Vec<u8>,
        pre_key_secret: &StaticSecret,
        handshake: Handshake,
        first_ratchet_key: [u8; 32],
        created_at: u64,
    ) -> Result<Self, CryptoError> {
        let mut session = Self {
            remote,
            role: SessionRole::Responder,
            created_at,
            associated_data,
            root_key: *shared_secret,
            ratchet_secret: pre_key_secret.to_bytes(),
            remote_ratchet_key: None,
            sending: None,
            receiving: None,
            previous_sending_length: 0,
            skipped: VecDeque::new(),
            pending_handshake: None,
            inbound_handshake: Some(handshake),
            messages_sent: 0,
            messages_received: 0,
        };
        session.dh_ratchet(first_ratchet_key)?;
        Ok(session)
    }

    pub(crate) fn info(&self) -> PairwiseSessionInfo {
        PairwiseSessionInfo {
            remote: self.remote.clone(),
            role: self.role,
            created_at: self.created_at,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            awaiting_reply: self.pending_handshake.is_some(),
        }
    }

    /// Whether `handshake` is the one that created this (inbound) session.
    pub(crate) fn was_created_by(&self, handshake: &Handshake) -> bool {
        self.inbound_handshake.as_ref() == Some(handshake)
    }

    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<PairwiseEnvelope, CryptoError> {
        let sending = self
            .sending
            .as_mut()
            .ok_or_else(|| CryptoError::NoSession(format!("no sending chain for {}", self.remote)))?;
        let message_key = sending.next_message_key()?;

        let ratchet_public = X25519Public::from(&StaticSecret::from(self.ratchet_secret));
        let mut envelope = PairwiseEnvelope {
            handshake: self.pending_handshake.clone(),
            header: MessageHeader {
                ratchet_key: ratchet_public.to_bytes(),
                previous_chain_length: self.previous_sending_length,
                index: message_key.index(),
            },
            ciphertext: Vec::new(),
        };
        let aad = envelope.authenticated_header(&self.associated_data);
        envelope.ciphertext = message_key.seal(plaintext, &aad)?;
        self.messages_sent += 1;
        Ok(envelope)
    }

    /// Decrypt in place. The caller works on a copy and only keeps it if
    /// this returns `Ok`, so a failed message never advances the ratchet.
    pub(crate) fn decrypt(
        &mut self,
        envelope: &PairwiseEnvelope,
        limits: SkipLimits,
    ) -> Result<Vec<u8>, CryptoError> {
        let aad = envelope.authenticated_header(&self.associated_data);
        let header = &envelope.header;

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.ratchet_key == header.ratchet_key && s.key.index() == header.index)
        {
            let plaintext = self.skipped[pos].key.open(&envelope.ciphertext, &aad)?;
            self.skipped.remove(pos);
            self.after_receive();
            return Ok(plaintext);
        }

        if self.remote_ratchet_key != Some(header.ratchet_key) {
            self.skip_until(header.previous_chain_length, limits)?;
            self.dh_ratchet(header.ratchet_key)?;
        }
        self.skip_until(header.index, limits)?;

        let receiving = self
            .receiving
            .as_mut()
            .ok_or_else(|| CryptoError::DecryptionError("no receiving chain".into()))?;
        if header.index < receiving.index() {
            return Err(CryptoError::DecryptionError(format!(
                "message {} already received",
                header.index
            )));
        }
        let message_key = receiving.next_message_key()?;
        let plaintext = message_key.open(&envelope.ciphertext, &aad)?;
        self.after_receive();
        Ok(plaintext)
    }

    fn after_receive(&mut self) {
        self.messages_received += 1;
        self.pending_handshake = None;
    }

    /// Buffer message keys of the receiving chain up to (not including) `until`.
    fn skip_until(&mut self, until: u32, limits: SkipLimits) -> Result<(), CryptoError> {
        let (Some(receiving), Some(ratchet_key)) = (self.receiving.as_mut(), self.remote_ratchet_key)
        else {
            return Ok(());
        };
        if until <= receiving.index() {
            return Ok(());
        }
        let gap = until - receiving.index();
        if gap > limits.max_skip {
            return Err(CryptoError::RatchetExhausted(format!(
                "message is {gap} steps ahead, window is {}",
                limits.max_skip
            )));
        }
        while receiving.index() < until {
            let key = receiving.next_message_key()?;
            self.skipped.push_back(SkippedKey { ratchet_key, key });
            if self.skipped.len() > limits.max_stored {
                self.skipped.pop_front();
            }
        }
        Ok(())
    }

    fn dh_ratchet(&mut self, their_ratchet_key: [u8; 32]) -> Result<(), CryptoError> {
        let their = X25519Public::from(their_ratchet_key);
        self.previous_sending_length = self.sending.as_ref().map_or(0, ChainKey::index);
        self.remote_ratchet_key = Some(their_ratchet_key);

        let dh = StaticSecret::from(self.ratchet_secret).diffie_hellman(&their);
        let (root_key, receiving) = kdf_root(&self.root_key, dh.as_bytes())?;
        self.root_key = root_key;
        self.receiving = Some(ChainKey::new(receiving, 0));

        let next_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dh = next_secret.diffie_hellman(&their);
        let (root_key, sending) = kdf_root(&self.root_key, dh.as_bytes())?;
        self.root_key = root_key;
        self.ratchet_secret = next_secret.to_bytes();
        self.sending = Some(ChainKey::new(sending, 0));
        Ok(())
    }
}

/// Root KDF: new root key and a fresh chain key from a DH output.
fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(ROOT_KEY_INFO, &mut okm)
        .map_err(|e| CryptoError::EncryptionError(format!("HKDF: {e}")))?;

    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((root, chain))
}

//! Symmetric chain-key ratchet shared by pairwise and group sessions.
//!
//! Each step derives a one-shot message key from the current chain key
//! and replaces the chain key with a one-way successor, so holding the
//! chain at index N reveals nothing about messages before N.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

const MESSAGE_KEY_INFO: &[u8] = b"RevlineMsgKey";
const CHAIN_KEY_INFO: &[u8] = b"RevlineChainKey";

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    pub(crate) fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    /// Index of the next message key this chain will produce.
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Message key for the current index, without advancing.
    pub(crate) fn message_key(&self) -> Result<MessageKey, CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(&self.key)
            .map_err(|e| CryptoError::EncryptionError(format!("HKDF: {e}")))?;
        let mut okm = [0u8; 44];
        hk.expand(MESSAGE_KEY_INFO, &mut okm)
            .map_err(|e| CryptoError::EncryptionError(format!("HKDF: {e}")))?;

        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok(MessageKey {
            key,
            nonce,
            index: self.index,
        })
    }

    /// Step the chain forward once.
    pub(crate) fn advance(&mut self) -> Result<(), CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(&self.key)
            .map_err(|e| CryptoError::EncryptionError(format!("HKDF: {e}")))?;
        let mut next = [0u8; 32];
        hk.expand(CHAIN_KEY_INFO, &mut next)
            .map_err(|e| CryptoError::EncryptionError(format!("HKDF: {e}")))?;
        self.key.zeroize();
        self.key = next;
        self.index = self
            .index
            .checked_add(1)
            .ok_or_else(|| CryptoError::RatchetExhausted("chain index overflow".into()))?;
        Ok(())
    }

    /// Message key for the current index, then advance.
    pub(crate) fn next_message_key(&mut self) -> Result<MessageKey, CryptoError> {
        let message_key = self.message_key()?;
        self.advance()?;
        Ok(message_key)
    }
}

/// Key material for exactly one message.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKey {
    key: [u8; 32],
    nonce: [u8; 12],
    index: u32,
}

impl MessageKey {
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// AES-256-GCM seal with `aad` bound to the ciphertext.
    pub(crate) fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        cipher
            .encrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))
    }

    /// Open a sealed message. Any tampering yields `DecryptionError`.
    pub(crate) fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionError("authentication failed".into()))
    }
}

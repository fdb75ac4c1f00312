use thiserror::Error;

/// Every failure the encryption core can report.
///
/// Each variant is scoped to a single message or session; none of them is
/// fatal to the process. Messages never contain plaintext or key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Persistence read/write failed. Prior state is left untouched.
    #[error("key storage error: {0}")]
    StorageError(String),

    /// A referenced pre-key or session key does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Malformed or unverifiable handshake.
    #[error("handshake rejected: {0}")]
    HandshakeError(String),

    /// No session exists for the requested conversation.
    #[error("no session: {0}")]
    NoSession(String),

    /// Authentication or integrity check failed; the message is dropped.
    #[error("decryption failed: {0}")]
    DecryptionError(String),

    /// The message is further ahead than the skip window allows.
    #[error("ratchet window exhausted: {0}")]
    RatchetExhausted(String),

    /// A group message index was already consumed or regressed.
    #[error("replayed message: {0}")]
    Replay(String),

    /// A different session key was offered for an initialized inbound session.
    #[error("session conflict: {0}")]
    SessionConflict(String),

    /// Public key material supplied by a caller could not be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    /// The identity account has not been initialized (or was destroyed).
    #[error("encryption account not initialized")]
    NotInitialized,
}

/// Fieldless mirror of [`CryptoError`] for callers that branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Storage,
    KeyNotFound,
    Handshake,
    NoSession,
    Decryption,
    RatchetExhausted,
    Replay,
    SessionConflict,
    InvalidKey,
    Encryption,
    NotInitialized,
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StorageError(_) => ErrorKind::Storage,
            Self::KeyNotFound(_) => ErrorKind::KeyNotFound,
            Self::HandshakeError(_) => ErrorKind::Handshake,
            Self::NoSession(_) => ErrorKind::NoSession,
            Self::DecryptionError(_) => ErrorKind::Decryption,
            Self::RatchetExhausted(_) => ErrorKind::RatchetExhausted,
            Self::Replay(_) => ErrorKind::Replay,
            Self::SessionConflict(_) => ErrorKind::SessionConflict,
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::EncryptionError(_) => ErrorKind::Encryption,
            Self::NotInitialized => ErrorKind::NotInitialized,
        }
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::StorageError(format!("corrupt record: {e}"))
    }
}

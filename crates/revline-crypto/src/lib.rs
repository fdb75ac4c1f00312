//! End-to-end encryption core for Revline chat.
//!
//! Pairwise conversations use an X3DH handshake followed by a double
//! ratchet; rooms use per-sender sender-key ratchets. All session state is
//! persisted through a [`KeyStore`] and every operation goes through
//! [`SessionCoordinator`].

pub mod account;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod group;
pub mod identity;
pub mod ids;
pub mod pairwise;
pub mod store;

mod ratchet;
mod table;

pub use account::{IdentityAccount, OneTimePreKey, PublicIdentity, PublishedPreKey};
pub use config::EncryptionConfig;
pub use coordinator::SessionCoordinator;
pub use error::{CryptoError, ErrorKind};
pub use group::{GroupMessage, GroupSessionKey, GroupSessionManager};
pub use identity::IdentityKeyPair;
pub use ids::{InboundGroupKey, PreKeyId, RemoteUserId, RoomId, SenderId};
pub use pairwise::{
    Handshake, MessageHeader, PairwiseEnvelope, PairwiseSessionInfo, PairwiseSessionManager,
    SessionRole,
};
pub use store::{FileKeyStore, KeyStore, MemoryKeyStore, SealedKeyStore};

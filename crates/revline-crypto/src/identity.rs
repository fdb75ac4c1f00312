//! Long-term device identity.
//!
//! One Ed25519 key signs pre-keys. The same scalar, mapped to Montgomery
//! form, is the X25519 identity key used in X3DH, so peers only ever
//! exchange the 32-byte Ed25519 public key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret seed, for persistence only.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 secret for key agreement: the clamped, SHA-512 expanded
    /// Ed25519 scalar. Its public half equals [`agreement_key`] of our
    /// Ed25519 public key.
    pub fn agreement_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Hex of the Ed25519 public key.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentityKeyPair")
            .field(&self.fingerprint())
            .finish()
    }
}

fn parse_identity_key(identity_key: &[u8; 32]) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_bytes(identity_key)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))
}

/// Check `signature` over `message` by the peer whose identity key is
/// `identity_key`. A well-formed signature that does not verify is a
/// `HandshakeError`.
pub fn verify_signature(
    identity_key: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let signature = Signature::from_slice(signature)
        .map_err(|e| CryptoError::InvalidKey(format!("malformed signature: {e}")))?;
    parse_identity_key(identity_key)?
        .verify(message, &signature)
        .map_err(|e| CryptoError::HandshakeError(format!("bad signature: {e}")))
}

/// X25519 identity key of a peer, from their Ed25519 identity key.
pub fn agreement_key(identity_key: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    let montgomery = parse_identity_key(identity_key)?.to_montgomery();
    Ok(X25519Public::from(montgomery.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_bind_message_and_key() {
        let identity = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let signature = identity.sign(b"track day").to_bytes();

        verify_signature(&identity.public_key_bytes(), b"track day", &signature).unwrap();
        assert!(matches!(
            verify_signature(&identity.public_key_bytes(), b"drag strip", &signature).unwrap_err(),
            CryptoError::HandshakeError(_)
        ));
        assert!(matches!(
            verify_signature(&other.public_key_bytes(), b"track day", &signature).unwrap_err(),
            CryptoError::HandshakeError(_)
        ));
        assert!(matches!(
            verify_signature(&identity.public_key_bytes(), b"track day", &signature[..63])
                .unwrap_err(),
            CryptoError::InvalidKey(_)
        ));
    }

    #[test]
    fn restored_identity_has_same_keys() {
        let identity = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(identity.secret_key_bytes());
        assert_eq!(identity.fingerprint(), restored.fingerprint());
        assert_eq!(
            identity.agreement_secret().to_bytes(),
            restored.agreement_secret().to_bytes()
        );
    }

    #[test]
    fn agreement_key_matches_own_secret() {
        let identity = IdentityKeyPair::generate();
        let derived = agreement_key(&identity.public_key_bytes()).unwrap();
        assert_eq!(
            X25519Public::from(&identity.agreement_secret()).as_bytes(),
            derived.as_bytes()
        );
    }

    #[test]
    fn identities_agree_on_shared_secret() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let to_bob = alice
            .agreement_secret()
            .diffie_hellman(&agreement_key(&bob.public_key_bytes()).unwrap());
        let to_alice = bob
            .agreement_secret()
            .diffie_hellman(&agreement_key(&alice.public_key_bytes()).unwrap());
        assert_eq!(to_bob.as_bytes(), to_alice.as_bytes());
    }

    #[test]
    fn debug_hides_secret() {
        let identity = IdentityKeyPair::generate();
        let shown = format!("{identity:?}");
        assert!(shown.contains(&identity.fingerprint()));
        assert!(!shown.contains(&hex::encode(identity.secret_key_bytes())));
    }
}

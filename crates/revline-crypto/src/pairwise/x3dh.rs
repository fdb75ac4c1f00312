//! Triple Diffie-Hellman key agreement for pairwise sessions.
//!
//! The initiator combines its identity key and a fresh ephemeral key with
//! the responder's identity key and one-time pre-key:
//!
//! ```text
//! DH1 = DH(IK_a, OPK_b)   DH2 = DH(EK_a, IK_b)   DH3 = DH(EK_a, OPK_b)
//! SK  = HKDF(0xFF * 32 || DH1 || DH2 || DH3)
//! ```
//!
//! The responder computes the same three values from the opposite side.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::CryptoError;

const X3DH_INFO: &[u8] = b"RevlineX3DH";

/// Initiator side. Returns the shared secret and the ephemeral public key
/// the responder needs.
pub(crate) fn initiate(
    local_identity: &StaticSecret,
    remote_identity: &X25519Public,
    remote_pre_key: &X25519Public,
) -> Result<(Zeroizing<[u8; 32]>, [u8; 32]), CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral).to_bytes();

    let dh1 = local_identity.diffie_hellman(remote_pre_key);
    let dh2 = ephemeral.diffie_hellman(remote_identity);
    let dh3 = ephemeral.diffie_hellman(remote_pre_key);

    Ok((derive(&[dh1, dh2, dh3])?, ephemeral_public))
}

/// Responder side, using the consumed one-time pre-key.
pub(crate) fn respond(
    local_identity: &StaticSecret,
    local_pre_key: &StaticSecret,
    remote_identity: &X25519Public,
    remote_ephemeral: &X25519Public,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let dh1 = local_pre_key.diffie_hellman(remote_identity);
    let dh2 = local_identity.diffie_hellman(remote_ephemeral);
    let dh3 = local_pre_key.diffie_hellman(remote_ephemeral);

    derive(&[dh1, dh2, dh3])
}

fn derive(shared: &[SharedSecret; 3]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if shared.iter().any(|s| !s.was_contributory()) {
        return Err(CryptoError::HandshakeError(
            "non-contributory Diffie-Hellman output".into(),
        ));
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(128));
    ikm.extend_from_slice(&[0xFF; 32]);
    for s in shared {
        ikm.extend_from_slice(s.as_bytes());
    }

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(X3DH_INFO, &mut okm[..])
        .map_err(|e| CryptoError::HandshakeError(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let alice_identity = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let bob_identity = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let bob_pre_key = StaticSecret::random_from_rng(rand::rngs::OsRng);

        let (alice_sk, ephemeral) = initiate(
            &alice_identity,
            &X25519Public::from(&bob_identity),
            &X25519Public::from(&bob_pre_key),
        )
        .unwrap();

        let bob_sk = respond(
            &bob_identity,
            &bob_pre_key,
            &X25519Public::from(&alice_identity),
            &X25519Public::from(ephemeral),
        )
        .unwrap();

        assert_eq!(*alice_sk, *bob_sk);
    }

    #[test]
    fn wrong_pre_key_gives_different_secret() {
        let alice_identity = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let bob_identity = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let bob_pre_key = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let other_pre_key = StaticSecret::random_from_rng(rand::rngs::OsRng);

        let (alice_sk, ephemeral) = initiate(
            &alice_identity,
            &X25519Public::from(&bob_identity),
            &X25519Public::from(&bob_pre_key),
        )
        .unwrap();
        let bob_sk = respond(
            &bob_identity,
            &other_pre_key,
            &X25519Public::from(&alice_identity),
            &X25519Public::from(ephemeral),
        )
        .unwrap();

        assert_ne!(*alice_sk, *bob_sk);
    }

    #[test]
    fn low_order_point_is_rejected() {
        let alice_identity = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let zero = X25519Public::from([0u8; 32]);
        let err = initiate(&alice_identity, &zero, &zero).unwrap_err();
        assert!(matches!(err, CryptoError::HandshakeError(_)));
    }
}

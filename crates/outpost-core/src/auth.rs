//! Ed25519 challenge-signature auth for the tunnel handshake.
//!
//! The broker never verifies a host key here; trust is rooted in the
//! client's private-key proof plus the pre-secured carrying socket.
//!
//! Both sides hash the same transcript and the client signs it:
//! `SHA-256(version || 0x00 || len(session_id) || session_id || nonce)`.
//! The session id is length-framed so no `(session_id, nonce)` pair
//! can collide with a different split of the same bytes.

use crate::error::{OutpostError, OutpostResult};
use crate::messages::PROTOCOL_VERSION;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// One broker challenge, borrowed from the handshake frames.
#[derive(Debug, Clone, Copy)]
pub struct Challenge<'a> {
    pub session_id: &'a str,
    pub nonce: &'a [u8],
}

impl Challenge<'_> {
    fn transcript(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(PROTOCOL_VERSION.as_bytes());
        hasher.update([0u8]);
        hasher.update((self.session_id.len() as u64).to_be_bytes());
        hasher.update(self.session_id.as_bytes());
        hasher.update(self.nonce);
        hasher.finalize().into()
    }

    /// Prove possession of the identity key. Returns the raw Ed25519
    /// signature bytes (64 bytes).
    pub fn sign(&self, signing_key: &SigningKey) -> Vec<u8> {
        signing_key.sign(&self.transcript()).to_bytes().to_vec()
    }

    /// Check a proof against a public key.
    pub fn verify(&self, verifying_key: &VerifyingKey, signature: &[u8]) -> bool {
        let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify(&self.transcript(), &sig).is_ok()
    }
}

/// Reconstruct a `VerifyingKey` from raw 32-byte public key bytes.
pub fn verifying_key_from_bytes(bytes: &[u8]) -> OutpostResult<VerifyingKey> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| OutpostError::AuthFailed("invalid public key length (expected 32 bytes)".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| OutpostError::AuthFailed(format!("invalid public key: {e}")))
}

/// Reconstruct a `SigningKey` from raw 32-byte secret key bytes.
pub fn signing_key_from_bytes(bytes: &[u8]) -> OutpostResult<SigningKey> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| OutpostError::AuthFailed("invalid secret key length (expected 32 bytes)".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SigningKey, VerifyingKey) {
        let mut csprng = rand::thread_rng();
        let sk = SigningKey::generate(&mut csprng);
        let vk = sk.verifying_key();
        (sk, vk)
    }

    #[test]
    fn sign_and_verify() {
        let (sk, vk) = keypair();
        let challenge = Challenge { session_id: "session-1", nonce: b"nonce-bytes" };
        let sig = challenge.sign(&sk);
        assert_eq!(sig.len(), 64);
        assert!(challenge.verify(&vk, &sig));
    }

    #[test]
    fn wrong_session_id_fails() {
        let (sk, vk) = keypair();
        let sig = Challenge { session_id: "session-a", nonce: b"nonce" }.sign(&sk);
        assert!(!Challenge { session_id: "session-b", nonce: b"nonce" }.verify(&vk, &sig));
    }

    #[test]
    fn wrong_nonce_fails() {
        let (sk, vk) = keypair();
        let sig = Challenge { session_id: "session", nonce: b"nonce-a" }.sign(&sk);
        assert!(!Challenge { session_id: "session", nonce: b"nonce-b" }.verify(&vk, &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let (sk, _) = keypair();
        let (_, other_vk) = keypair();
        let challenge = Challenge { session_id: "session", nonce: b"nonce" };
        let sig = challenge.sign(&sk);
        assert!(!challenge.verify(&other_vk, &sig));
    }

    #[test]
    fn session_id_framing_prevents_boundary_shifts() {
        // "ab" + "c" and "a" + "bc" hash the same bytes but must not
        // produce interchangeable transcripts.
        let (sk, vk) = keypair();
        let sig = Challenge { session_id: "ab", nonce: b"c" }.sign(&sk);
        assert!(!Challenge { session_id: "a", nonce: b"bc" }.verify(&vk, &sig));
    }

    #[test]
    fn key_bytes_round_trip() {
        let (sk, vk) = keypair();
        let sk2 = signing_key_from_bytes(&sk.to_bytes()).unwrap();
        let vk2 = verifying_key_from_bytes(&vk.to_bytes()).unwrap();
        assert_eq!(sk2.verifying_key(), vk2);
    }

    #[test]
    fn garbage_signature_is_rejected_not_panicked() {
        let (_, vk) = keypair();
        let challenge = Challenge { session_id: "s", nonce: b"n" };
        assert!(!challenge.verify(&vk, b"way too short"));
    }
}

//! Ed25519 key pairs.
//!
//! The public half is the peer identity and relay mailbox address; the
//! 32-byte secret seed signs envelopes and, converted to X25519, opens
//! sealed payloads.

use std::fmt;

use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use peerlog_transport::PublicKey;

use crate::ProtocolError;

#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: [u8; 32],
}

impl KeyPair {
    /// Fresh random key pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic key pair from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        Self {
            public: PublicKey::from_bytes(signing.verifying_key().to_bytes()),
            secret: seed,
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_seed(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.secret).sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Strict Ed25519 verification of `signature` over `message` by `signer`.
pub fn verify(signer: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), ProtocolError> {
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| ProtocolError::InvalidSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(signer.as_bytes()).map_err(|_| ProtocolError::InvalidSignature)?;
    verifying_key
        .verify_strict(message, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
        .map_err(|_| ProtocolError::InvalidSignature)
}

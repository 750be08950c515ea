//! Signed, sealed envelopes carried by the relay.

use peerlog_transport::{now_ms, PublicKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, bin, SealedBox};
use crate::{identity, KeyPair, ProtocolError};

/// Encrypt-and-sign / decrypt-and-verify capability the broker is built on.
///
/// Implementations must guarantee that only the holder of the recipient's
/// secret recovers `data`, and that the sender returned by
/// [`decrypt_and_verify`](Self::decrypt_and_verify) is bound to `data`.
pub trait CryptoEnvelope: Send + Sync + 'static {
    fn encrypt_and_sign(
        &self,
        from: &KeyPair,
        to: &PublicKey,
        data: &[u8],
    ) -> Result<Vec<u8>, ProtocolError>;

    fn decrypt_and_verify(&self, own: &KeyPair, envelope: &[u8]) -> Result<Opened, ProtocolError>;
}

/// A verified, decrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    /// Authenticated sender.
    pub sender: PublicKey,
    pub data: Vec<u8>,
}

/// Wire form of a sealed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub from: PublicKey,
    pub to: PublicKey,
    pub sealed: SealedBox,
    pub timestamp: u64,
    /// Ed25519 signature over [`Envelope::signing_bytes`].
    #[serde(with = "bin")]
    pub signature: Vec<u8>,
}

/// Everything the signature covers.
#[derive(Serialize)]
struct Signable<'a> {
    id: &'a str,
    from: &'a PublicKey,
    to: &'a PublicKey,
    sealed: &'a SealedBox,
    timestamp: u64,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Canonical bytes the signature covers. Deterministic for a given envelope.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let signable = Signable {
            id: &self.id,
            from: &self.from,
            to: &self.to,
            sealed: &self.sealed,
            timestamp: self.timestamp,
        };
        rmp_serde::to_vec_named(&signable).map_err(Into::into)
    }

    pub fn verify_signature(&self) -> Result<(), ProtocolError> {
        identity::verify(&self.from, &self.signing_bytes()?, &self.signature)
    }
}

/// Default [`CryptoEnvelope`]: X25519/XChaCha20-Poly1305 sealing plus an
/// Ed25519 signature over the sealed form.
#[derive(Debug, Clone, Copy, Default)]
pub struct SealedEnvelope;

impl CryptoEnvelope for SealedEnvelope {
    fn encrypt_and_sign(
        &self,
        from: &KeyPair,
        to: &PublicKey,
        data: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            from: *from.public(),
            to: *to,
            sealed: crypto::seal(data, to)?,
            timestamp: now_ms(),
            signature: Vec::new(),
        };
        envelope.signature = from.sign(&envelope.signing_bytes()?).to_vec();
        envelope.to_bytes()
    }

    fn decrypt_and_verify(&self, own: &KeyPair, envelope: &[u8]) -> Result<Opened, ProtocolError> {
        let envelope = Envelope::from_bytes(envelope)?;
        envelope.verify_signature()?;
        if envelope.to != *own.public() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("addressed to {:?}", envelope.to),
            });
        }
        let data = crypto::open(&envelope.sealed, own)?;
        Ok(Opened {
            sender: envelope.from,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (KeyPair, KeyPair) {
        (KeyPair::from_seed([1; 32]), KeyPair::from_seed([2; 32]))
    }

    #[test]
    fn seal_then_open_recovers_sender() {
        let (alice, bob) = pair();
        let bytes = SealedEnvelope
            .encrypt_and_sign(&alice, bob.public(), b"hello")
            .unwrap();
        let opened = SealedEnvelope.decrypt_and_verify(&bob, &bytes).unwrap();
        assert_eq!(opened.sender, *alice.public());
        assert_eq!(opened.data, b"hello");
    }

    #[test]
    fn flipped_signature_byte_is_rejected() {
        let (alice, bob) = pair();
        let bytes = SealedEnvelope
            .encrypt_and_sign(&alice, bob.public(), b"hello")
            .unwrap();
        let mut envelope = Envelope::from_bytes(&bytes).unwrap();
        envelope.signature[10] ^= 0x80;
        let err = SealedEnvelope
            .decrypt_and_verify(&bob, &envelope.to_bytes().unwrap())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature));
    }

    #[test]
    fn forged_sender_is_rejected() {
        let (alice, bob) = pair();
        let mallory = KeyPair::from_seed([3; 32]);
        let bytes = SealedEnvelope
            .encrypt_and_sign(&mallory, bob.public(), b"trust me")
            .unwrap();
        let mut envelope = Envelope::from_bytes(&bytes).unwrap();
        envelope.from = *alice.public();
        let err = SealedEnvelope
            .decrypt_and_verify(&bob, &envelope.to_bytes().unwrap())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature));
    }

    #[test]
    fn envelope_for_someone_else_is_rejected() {
        let (alice, bob) = pair();
        let carol = KeyPair::from_seed([4; 32]);
        let bytes = SealedEnvelope
            .encrypt_and_sign(&alice, carol.public(), b"not for bob")
            .unwrap();
        let err = SealedEnvelope.decrypt_and_verify(&bob, &bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEnvelope { .. }));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let (_, bob) = pair();
        let err = SealedEnvelope
            .decrypt_and_verify(&bob, b"\x00\x01\x02")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn signing_bytes_are_deterministic() {
        let (alice, bob) = pair();
        let bytes = SealedEnvelope
            .encrypt_and_sign(&alice, bob.public(), b"x")
            .unwrap();
        let envelope = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(
            envelope.signing_bytes().unwrap(),
            envelope.clone().signing_bytes().unwrap()
        );
    }
}

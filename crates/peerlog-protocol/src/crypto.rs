//! Sealing payloads to an Ed25519 identity.
//!
//! Ephemeral X25519 Diffie-Hellman against the recipient's key (converted
//! Edwards → Montgomery, libsodium-compatible), HKDF-SHA256, then
//! XChaCha20-Poly1305. The recipient's public key is bound in as associated
//! data, so a sealed box re-addressed to someone else fails to open.

use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use hkdf::Hkdf;
use peerlog_transport::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{KeyPair, ProtocolError};

const KDF_INFO: &[u8] = b"peerlog-sealed-box-xchacha20poly1305-v1";

/// Ciphertext plus what the recipient needs to recover the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "bin")]
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 24],
    pub ephemeral: [u8; 32],
}

/// Serialize `Vec<u8>` as a MessagePack bin instead of an array of ints.
pub(crate) mod bin {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let buf = bytes::Bytes::deserialize(d)?;
        Ok(buf.to_vec())
    }
}

/// Map an Ed25519 verifying key onto Curve25519.
pub fn x25519_public(key: &PublicKey) -> Result<X25519Public, ProtocolError> {
    let point = CompressedEdwardsY(*key.as_bytes())
        .decompress()
        .ok_or_else(|| ProtocolError::Crypto(format!("{key:?} is not a curve point")))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Clamped X25519 scalar derived from an Ed25519 seed.
pub fn x25519_secret(seed: &[u8; 32]) -> StaticSecret {
    let digest = Sha512::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    StaticSecret::from(scalar)
}

fn cipher_for(shared: &[u8; 32]) -> Result<XChaCha20Poly1305, ProtocolError> {
    let mut key = [0u8; 32];
    Hkdf::<Sha256>::new(None, shared)
        .expand(KDF_INFO, &mut key)
        .map_err(|e| ProtocolError::Crypto(format!("key derivation: {e}")))?;
    Ok(XChaCha20Poly1305::new(&key.into()))
}

/// Seal `plaintext` so only the holder of `recipient`'s secret can open it.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<SealedBox, ProtocolError> {
    let their_public = x25519_public(recipient)?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let shared = ephemeral.diffie_hellman(&their_public);

    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher_for(shared.as_bytes())?
        .encrypt(
            &XNonce::from(nonce),
            Payload {
                msg: plaintext,
                aad: recipient.as_bytes(),
            },
        )
        .map_err(|e| ProtocolError::Crypto(format!("seal: {e}")))?;

    Ok(SealedBox {
        ciphertext,
        nonce,
        ephemeral: X25519Public::from(&ephemeral).to_bytes(),
    })
}

/// Open a box sealed to `own`.
pub fn open(sealed: &SealedBox, own: &KeyPair) -> Result<Vec<u8>, ProtocolError> {
    let secret = x25519_secret(own.secret_seed());
    let shared = secret.diffie_hellman(&X25519Public::from(sealed.ephemeral));

    cipher_for(shared.as_bytes())?
        .decrypt(
            &XNonce::from(sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: own.public().as_bytes(),
            },
        )
        .map_err(|_| ProtocolError::Crypto("sealed box did not open".into()))
}

//! Hybrid ML-KEM-768 + X25519 key encapsulation.
//!
//! A 256-bit media key is sealed under both a lattice KEM and a classical
//! ECDH; the wrap key is `SHA-256(kem_ss ‖ ecdh_ss ‖ "onestar-hybrid-v1")`.
//! Confidentiality survives a break of either family.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::encoding::{b64, b64_arr};
use crate::error::{Result, VaultError};
use crate::primitives::{
    self, ECDH_LEN, IV_LEN, KEM_CIPHERTEXT_LEN, KEM_PUBLIC_LEN, KEY_LEN, TAG_LEN,
};

/// Domain separation for the shared-secret combiner.
const COMBINER_LABEL: &[u8] = b"onestar-hybrid-v1";

/// Shareable half of a hybrid keypair. No secrecy requirement.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridPublicKey {
    #[serde(with = "b64")]
    pub kem_public: Vec<u8>,
    #[serde(with = "b64_arr")]
    pub ecdh_public: [u8; ECDH_LEN],
}

impl HybridPublicKey {
    /// SHA-256 over the serialized public key (KEM half ‖ ECDH half).
    /// Stable identifier for merge deduplication and logging.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(self.kem_public.len() + ECDH_LEN);
        buf.extend_from_slice(&self.kem_public);
        buf.extend_from_slice(&self.ecdh_public);
        primitives::sha256(&buf)
    }

    /// First 16 hex chars of the fingerprint, for log lines.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(&self.fingerprint()[..8])
    }
}

impl fmt::Debug for HybridPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HybridPublicKey({})", self.fingerprint_hex())
    }
}

/// Secret half of a hybrid keypair. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct HybridPrivateKey {
    #[serde(with = "b64")]
    pub kem_private: Vec<u8>,
    #[serde(with = "b64_arr")]
    pub ecdh_private: [u8; ECDH_LEN],
}

impl fmt::Debug for HybridPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HybridPrivateKey([REDACTED])")
    }
}

/// A full hybrid keypair with its process-unique identity.
#[derive(Clone)]
pub struct HybridKeypair {
    pub public: HybridPublicKey,
    pub private: HybridPrivateKey,
    pub key_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for HybridKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridKeypair")
            .field("key_id", &self.key_id)
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Self-contained envelope around a wrapped media key. Bound to the
/// recipient public key by construction; carries no recipient metadata.
#[derive(Clone, Serialize, Deserialize)]
pub struct HybridCiphertext {
    #[serde(with = "b64")]
    pub kem_ciphertext: Vec<u8>,
    #[serde(with = "b64_arr")]
    pub ecdh_ephemeral_public: [u8; ECDH_LEN],
    #[serde(with = "b64_arr")]
    pub iv: [u8; IV_LEN],
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64_arr")]
    pub auth_tag: [u8; TAG_LEN],
}

impl fmt::Debug for HybridCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridCiphertext")
            .field("kem_ciphertext_len", &self.kem_ciphertext.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// A 256-bit per-media symmetric key. Exists transiently around wrap/unwrap;
/// zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MediaKey([u8; KEY_LEN]);

impl MediaKey {
    /// Fresh random media key.
    pub fn generate() -> Self {
        Self(primitives::random_array())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaKey([REDACTED])")
    }
}

/// Generate a fresh hybrid keypair with a new `key_id`.
pub fn generate_keypair() -> Result<HybridKeypair> {
    let (kem_private, kem_public) = primitives::mlkem_keygen();
    let (ecdh_private, ecdh_public) = primitives::x25519_keygen();

    Ok(HybridKeypair {
        public: HybridPublicKey {
            kem_public,
            ecdh_public,
        },
        private: HybridPrivateKey {
            kem_private: kem_private.to_vec(),
            ecdh_private: *ecdh_private,
        },
        key_id: Uuid::now_v7(),
        created_at: Utc::now(),
    })
}

/// `SHA-256(kem_ss ‖ ecdh_ss ‖ label)`, truncated to 32 bytes.
fn combine_secrets(kem_ss: &[u8; KEY_LEN], ecdh_ss: &[u8; KEY_LEN]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(KEY_LEN * 2 + COMBINER_LABEL.len()));
    ikm.extend_from_slice(kem_ss);
    ikm.extend_from_slice(ecdh_ss);
    ikm.extend_from_slice(COMBINER_LABEL);
    Zeroizing::new(primitives::sha256(&ikm))
}

/// Wrap a media key to a recipient hybrid public key.
pub fn wrap(media_key: &MediaKey, recipient: &HybridPublicKey) -> Result<HybridCiphertext> {
    if recipient.kem_public.len() != KEM_PUBLIC_LEN {
        return Err(VaultError::PrimitiveFailure(
            "malformed recipient public key".into(),
        ));
    }

    let (kem_ciphertext, kem_ss) = primitives::mlkem_encapsulate(&recipient.kem_public)?;

    let (ephemeral_private, ecdh_ephemeral_public) = primitives::x25519_keygen();
    let ecdh_ss = primitives::x25519_diffie_hellman(&ephemeral_private, &recipient.ecdh_public);

    let wrap_key = combine_secrets(&kem_ss, &ecdh_ss);
    let iv = primitives::random_array::<IV_LEN>();
    let (ciphertext, auth_tag) = primitives::aes_gcm_seal(&wrap_key, &iv, &[], media_key.as_bytes())?;

    Ok(HybridCiphertext {
        kem_ciphertext,
        ecdh_ephemeral_public,
        iv,
        ciphertext,
        auth_tag,
    })
}

/// Unwrap a media key with a recipient keypair. Every failure mode — wrong
/// keypair, KEM mismatch, tag mismatch, malformed envelope — surfaces as the
/// same generic [`VaultError::UnwrapFailure`].
pub fn unwrap(ct: &HybridCiphertext, keypair: &HybridKeypair) -> Result<MediaKey> {
    unwrap_inner(ct, keypair).map_err(|e| {
        tracing::debug!(key_id = %keypair.key_id, cause = %e, "unwrap attempt failed");
        VaultError::UnwrapFailure
    })
}

fn unwrap_inner(ct: &HybridCiphertext, keypair: &HybridKeypair) -> Result<MediaKey> {
    if ct.kem_ciphertext.len() != KEM_CIPHERTEXT_LEN {
        return Err(VaultError::PrimitiveFailure("malformed envelope".into()));
    }

    let kem_ss = primitives::mlkem_decapsulate(&keypair.private.kem_private, &ct.kem_ciphertext)?;
    let ecdh_ss = primitives::x25519_diffie_hellman(
        &keypair.private.ecdh_private,
        &ct.ecdh_ephemeral_public,
    );

    let wrap_key = combine_secrets(&kem_ss, &ecdh_ss);
    let plaintext = Zeroizing::new(primitives::aes_gcm_open(
        &wrap_key,
        &ct.iv,
        &[],
        &ct.ciphertext,
        &ct.auth_tag,
    )?);

    let bytes: [u8; KEY_LEN] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| VaultError::PrimitiveFailure("unexpected media key length".into()))?;
    Ok(MediaKey::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let keypair = generate_keypair().unwrap();
        let media_key = MediaKey::generate();

        let ct = wrap(&media_key, &keypair.public).unwrap();
        assert_eq!(ct.kem_ciphertext.len(), KEM_CIPHERTEXT_LEN);
        assert_eq!(ct.ciphertext.len(), KEY_LEN);

        let recovered = unwrap(&ct, &keypair).unwrap();
        assert_eq!(recovered.as_bytes(), media_key.as_bytes());
    }

    #[test]
    fn wrong_keypair_fails_generically() {
        let keypair = generate_keypair().unwrap();
        let other = generate_keypair().unwrap();
        let media_key = MediaKey::generate();

        let ct = wrap(&media_key, &keypair.public).unwrap();
        match unwrap(&ct, &other) {
            Err(VaultError::UnwrapFailure) => {}
            other => panic!("expected UnwrapFailure, got {other:?}"),
        }
    }

    #[test]
    fn tampered_envelope_fails_generically() {
        let keypair = generate_keypair().unwrap();
        let media_key = MediaKey::generate();
        let mut ct = wrap(&media_key, &keypair.public).unwrap();

        ct.auth_tag[3] ^= 0x40;
        match unwrap(&ct, &keypair) {
            Err(VaultError::UnwrapFailure) => {}
            other => panic!("expected UnwrapFailure, got {other:?}"),
        }
    }

    #[test]
    fn tampered_kem_ciphertext_fails_generically() {
        let keypair = generate_keypair().unwrap();
        let media_key = MediaKey::generate();
        let mut ct = wrap(&media_key, &keypair.public).unwrap();

        ct.kem_ciphertext[17] ^= 0x01;
        assert!(matches!(
            unwrap(&ct, &keypair),
            Err(VaultError::UnwrapFailure)
        ));
    }

    #[test]
    fn envelopes_are_nondeterministic() {
        let keypair = generate_keypair().unwrap();
        let media_key = MediaKey::generate();

        let a = wrap(&media_key, &keypair.public).unwrap();
        let b = wrap(&media_key, &keypair.public).unwrap();
        assert_ne!(a.kem_ciphertext, b.kem_ciphertext);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = generate_keypair().unwrap();
        let b = generate_keypair().unwrap();
        assert_eq!(a.public.fingerprint(), a.public.fingerprint());
        assert_ne!(a.public.fingerprint(), b.public.fingerprint());
    }

    #[test]
    fn ciphertext_serde_roundtrip() {
        let keypair = generate_keypair().unwrap();
        let ct = wrap(&MediaKey::generate(), &keypair.public).unwrap();

        let json = serde_json::to_string(&ct).unwrap();
        let back: HybridCiphertext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kem_ciphertext, ct.kem_ciphertext);
        assert_eq!(back.iv, ct.iv);
        assert_eq!(back.auth_tag, ct.auth_tag);
    }

    #[test]
    fn debug_never_prints_private_material() {
        let keypair = generate_keypair().unwrap();
        let debug = format!("{keypair:?}");
        assert!(debug.contains("REDACTED"));

        let media_key = MediaKey::generate();
        assert!(format!("{media_key:?}").contains("REDACTED"));
    }
}

//! Uniform access to the cryptographic primitives the vault consumes.
//!
//! Every operation either succeeds or fails with
//! [`VaultError::PrimitiveFailure`]; nothing in here falls back to a weaker
//! construction. AEAD open failures are reported through the same generic
//! error so that call sites decide what (if anything) a caller may learn.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Result, VaultError};

type Dk768 = <MlKem768 as KemCore>::DecapsulationKey;
type Ek768 = <MlKem768 as KemCore>::EncapsulationKey;
type Dk768Size = <Dk768 as EncodedSizeUser>::EncodedSize;
type Ek768Size = <Ek768 as EncodedSizeUser>::EncodedSize;

/// AES-256-GCM nonce length.
pub const IV_LEN: usize = 12;
/// AES-256-GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// Symmetric key length (AES-256, HMAC keys, media keys).
pub const KEY_LEN: usize = 32;

/// ML-KEM-768 encapsulation (public) key length.
pub const KEM_PUBLIC_LEN: usize = 1184;
/// ML-KEM-768 decapsulation (private) key length.
pub const KEM_PRIVATE_LEN: usize = 2400;
/// ML-KEM-768 ciphertext length.
pub const KEM_CIPHERTEXT_LEN: usize = 1088;
/// X25519 key length, both halves.
pub const ECDH_LEN: usize = 32;

/// Fill a buffer with bytes from the OS CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Fixed-size random array from the OS CSPRNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Constant-time byte comparison. Length mismatch returns false; length is
/// not secret in any of our formats.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Overwrite a buffer in place, resistant to being optimized away.
/// Best-effort: copies the allocator may have made are out of reach.
pub fn zeroize_buf(buf: &mut [u8]) {
    buf.zeroize();
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// HMAC-SHA256 over `data` with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| VaultError::PrimitiveFailure(format!("HMAC key setup failed: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// PBKDF2-SHA512 → 32-byte key. Deliberately slow at the iteration counts we
/// run it at; callers on an interactive thread must move it off with
/// `spawn_blocking`.
pub fn pbkdf2_sha512(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut *out);
    out
}

/// AES-256-GCM seal with explicit 12-byte IV. Returns ciphertext and the
/// detached 16-byte tag.
pub fn aes_gcm_seal(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN])> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::PrimitiveFailure(format!("invalid AES key: {e}")))?;

    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| VaultError::PrimitiveFailure(format!("AEAD seal failed: {e}")))?;

    let split = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[split..]);
    sealed.truncate(split);
    Ok((sealed, tag))
}

/// AES-256-GCM open with detached tag. Tag mismatch and any other failure
/// come back as the same `PrimitiveFailure`; callers translate to their own
/// surface error without distinguishing causes.
pub fn aes_gcm_open(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::PrimitiveFailure(format!("invalid AES key: {e}")))?;

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| VaultError::PrimitiveFailure("AEAD open failed".into()))
}

/// Generate an ML-KEM-768 keypair. Returns `(decapsulation key, encapsulation
/// key)` in their FIPS 203 byte encodings (2400 and 1184 bytes).
pub fn mlkem_keygen() -> (Zeroizing<Vec<u8>>, Vec<u8>) {
    let (dk, ek) = MlKem768::generate(&mut OsRng);
    (
        Zeroizing::new(dk.as_bytes().to_vec()),
        ek.as_bytes().to_vec(),
    )
}

/// ML-KEM-768 encapsulation against a serialized encapsulation key. Returns
/// the 1088-byte ciphertext and the 32-byte shared secret.
pub fn mlkem_encapsulate(ek_bytes: &[u8]) -> Result<(Vec<u8>, Zeroizing<[u8; KEY_LEN]>)> {
    let ek_array = ml_kem::array::Array::<u8, Ek768Size>::try_from(ek_bytes)
        .map_err(|_| VaultError::PrimitiveFailure("malformed ML-KEM encapsulation key".into()))?;
    let ek = Ek768::from_bytes(&ek_array);

    let (ct, shared) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| VaultError::PrimitiveFailure("ML-KEM encapsulation failed".into()))?;

    let mut ss = Zeroizing::new([0u8; KEY_LEN]);
    ss.copy_from_slice(&shared);
    Ok((ct.to_vec(), ss))
}

/// ML-KEM-768 decapsulation. Implicit rejection means a foreign ciphertext
/// yields a garbage shared secret rather than an error; the mismatch is
/// caught downstream when the AEAD tag fails to verify.
pub fn mlkem_decapsulate(dk_bytes: &[u8], ct_bytes: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let dk_array = ml_kem::array::Array::<u8, Dk768Size>::try_from(dk_bytes)
        .map_err(|_| VaultError::PrimitiveFailure("malformed ML-KEM decapsulation key".into()))?;
    let dk = Dk768::from_bytes(&dk_array);

    let ct = ml_kem::Ciphertext::<MlKem768>::try_from(ct_bytes)
        .map_err(|_| VaultError::PrimitiveFailure("malformed ML-KEM ciphertext".into()))?;

    let shared = dk
        .decapsulate(&ct)
        .map_err(|_| VaultError::PrimitiveFailure("ML-KEM decapsulation failed".into()))?;

    let mut ss = Zeroizing::new([0u8; KEY_LEN]);
    ss.copy_from_slice(&shared);
    Ok(ss)
}

/// Generate an X25519 keypair. Returns `(private, public)`.
pub fn x25519_keygen() -> (Zeroizing<[u8; ECDH_LEN]>, [u8; ECDH_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    (Zeroizing::new(secret.to_bytes()), *public.as_bytes())
}

/// X25519 Diffie-Hellman between a private scalar and a peer public key.
/// Covers both directions of the static-ephemeral exchange.
pub fn x25519_diffie_hellman(
    private: &[u8; ECDH_LEN],
    public: &[u8; ECDH_LEN],
) -> Zeroizing<[u8; KEY_LEN]> {
    let secret = StaticSecret::from(*private);
    let shared = secret.diffie_hellman(&X25519Public::from(*public));
    Zeroizing::new(*shared.as_bytes())
}

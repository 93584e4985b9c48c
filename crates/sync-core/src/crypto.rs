//! Wraps the fixed library of crypto primitives the sync engine is allowed
//! to use (spec.md §4.1): key derivation, symmetric encryption, and the
//! X25519 sealed-box construction used for device-to-device handoff.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::types::{ConnectInfo, KeyBytes, RecoveryKey};

const NONCE_LEN: usize = 12;

const INFO_PRIMARY_KEY: &[u8] = b"sync-primary-key-v1";
const INFO_PASSWORD_HASH: &[u8] = b"sync-password-hash-v1";
const INFO_STRETCHED_PRIMARY_KEY: &[u8] = b"sync-stretched-primary-key-v1";
const INFO_SEALED_BOX: &[u8] = b"sync-sealed-box-v1";

/// Output of `create_account_keys` (spec.md §4.1).
pub struct AccountKeys {
    pub primary_key: KeyBytes,
    pub secret_key: KeyBytes,
    pub protected_secret_key: Vec<u8>,
    pub password_hash: String,
}

/// Output of `extract_login_info` (spec.md §4.1).
pub struct LoginInfo {
    pub password_hash: String,
    pub stretched_primary_key: KeyBytes,
}

fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out)
        .map_err(|_| CryptoError::FailedToCreateAccountKeys(-1))?;
    Ok(out)
}

fn derive_primary_key(user_id: &str, password: &str) -> Result<[u8; 32], CryptoError> {
    hkdf_expand(password.as_bytes(), user_id.as_bytes(), INFO_PRIMARY_KEY)
        .map_err(|_| CryptoError::FailedToCreateAccountKeys(-1))
}

fn derive_password_hash(user_id: &str, primary_key: &[u8; 32]) -> Result<String, CryptoError> {
    let hash = hkdf_expand(primary_key, user_id.as_bytes(), INFO_PASSWORD_HASH)
        .map_err(|_| CryptoError::FailedToCreateAccountKeys(-2))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(hash))
}

fn derive_stretched_primary_key(
    user_id: &str,
    primary_key: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    hkdf_expand(primary_key, user_id.as_bytes(), INFO_STRETCHED_PRIMARY_KEY)
        .map_err(|_| CryptoError::FailedToCreateAccountKeys(-3))
}

fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::FailedToEncryptValue(-1))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_decrypt(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::FailedToDecryptValue(-2));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::FailedToDecryptValue(-1))
}

/// Generate a fresh account's primary key, secret key, protected secret key
/// wrapping, and password hash (spec.md §4.1).
pub fn create_account_keys(user_id: &str, password: &str) -> Result<AccountKeys, CryptoError> {
    let primary_key = derive_primary_key(user_id, password)?;
    let password_hash = derive_password_hash(user_id, &primary_key)?;
    let stretched_primary_key = derive_stretched_primary_key(user_id, &primary_key)?;

    let mut secret_key = [0u8; 32];
    OsRng.fill_bytes(&mut secret_key);

    let protected_secret_key = aead_encrypt(&stretched_primary_key, &secret_key)
        .map_err(|_| CryptoError::FailedToCreateAccountKeys(-4))?;

    Ok(AccountKeys {
        primary_key: KeyBytes(primary_key),
        secret_key: KeyBytes(secret_key),
        protected_secret_key,
        password_hash,
    })
}

/// Re-derive the password hash and key-unwrapping key from a `RecoveryKey`
/// (spec.md §4.1, §8 invariant 1). No password is needed here: the
/// recovery key already carries the primary key.
pub fn extract_login_info(recovery_key: &RecoveryKey) -> Result<LoginInfo, CryptoError> {
    let primary_key = recovery_key.primary_key.as_bytes();
    let password_hash = derive_password_hash(&recovery_key.user_id, primary_key)?;
    let stretched_primary_key =
        derive_stretched_primary_key(&recovery_key.user_id, primary_key)?;
    Ok(LoginInfo {
        password_hash,
        stretched_primary_key: KeyBytes(stretched_primary_key),
    })
}

/// Unwrap a `protected_secret_key` blob with a stretched primary key.
pub fn extract_secret_key(
    protected_secret_key: &[u8],
    stretched_primary_key: &KeyBytes,
) -> Result<KeyBytes, CryptoError> {
    let bytes = aead_decrypt(stretched_primary_key.as_bytes(), protected_secret_key)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::FailedToDecryptValue(-3))?;
    Ok(KeyBytes(arr))
}

/// Encrypt a string under the account's secret key.
///
/// An empty plaintext encrypts to an empty string so that
/// `decrypt_string(encrypt_string("", k), k) == ""` round-trips without
/// going through the AEAD at all (spec.md §8 invariant: decrypting an
/// empty string yields an empty string).
pub fn encrypt_string(plaintext: &str, key: &KeyBytes) -> Result<String, CryptoError> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    let blob = aead_encrypt(key.as_bytes(), plaintext.as_bytes())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

/// Decrypt a string produced by `encrypt_string`.
///
/// An empty input always decrypts to an empty string, by explicit rule —
/// it is never passed to the AEAD (there is no nonce to recover).
pub fn decrypt_string(ciphertext_b64: &str, key: &KeyBytes) -> Result<String, CryptoError> {
    if ciphertext_b64.is_empty() {
        return Ok(String::new());
    }
    let blob = base64::engine::general_purpose::STANDARD
        .decode(ciphertext_b64)
        .map_err(|_| CryptoError::FailedToDecryptValue(-4))?;
    let plaintext = aead_decrypt(key.as_bytes(), &blob)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::FailedToDecryptValue(-5))
}

/// Generate a device's long-lived connect identity: an X25519 key pair and
/// a fresh `device_id` (spec.md §4.1, §4.6).
pub fn prepare_for_connect() -> Result<ConnectInfo, CryptoError> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    Ok(ConnectInfo {
        device_id: Uuid::new_v4().to_string(),
        public_key: public.to_bytes(),
        secret_key: KeyBytes(secret.to_bytes()),
    })
}

fn sealed_box_key(shared_secret: &[u8; 32], eph_public: &[u8; 32], recipient_public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(eph_public);
    salt.extend_from_slice(recipient_public);
    hkdf_expand(shared_secret, &salt, INFO_SEALED_BOX).map_err(|_| CryptoError::FailedToSealData(-1))
}

/// Anonymous-sender sealed box: encrypt `data` so that only the holder of
/// `recipient_secret_key` (matching `recipient_public_key`) can open it, with
/// no sender identity recoverable from the ciphertext (spec.md §4.1, §4.6).
/// Output layout: `ephemeral_public_key(32) || nonce(12) || ciphertext+tag`.
pub fn seal(data: &[u8], recipient_public_key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_public = PublicKey::from(&eph_secret);
    let recipient = PublicKey::from(*recipient_public_key);
    let shared = eph_secret.diffie_hellman(&recipient);

    let key = sealed_box_key(shared.as_bytes(), eph_public.as_bytes(), recipient_public_key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = ChaCha20Poly1305::new((&key).into());
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|_| CryptoError::FailedToSealData(-2))?;

    let mut out = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(eph_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a box produced by `seal`.
pub fn unseal(
    sealed: &[u8],
    recipient_public_key: &[u8; 32],
    recipient_secret_key: &KeyBytes,
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < 32 + NONCE_LEN {
        return Err(CryptoError::FailedToOpenSealedBox(-1));
    }
    let (eph_public_bytes, rest) = sealed.split_at(32);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let eph_public: [u8; 32] = eph_public_bytes
        .try_into()
        .map_err(|_| CryptoError::FailedToOpenSealedBox(-2))?;

    let secret = StaticSecret::from(*recipient_secret_key.as_bytes());
    let shared = secret.diffie_hellman(&PublicKey::from(eph_public));

    let key = sealed_box_key(shared.as_bytes(), &eph_public, recipient_public_key)
        .map_err(|_| CryptoError::FailedToOpenSealedBox(-3))?;

    let cipher = ChaCha20Poly1305::new((&key).into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::FailedToOpenSealedBox(-4))
}

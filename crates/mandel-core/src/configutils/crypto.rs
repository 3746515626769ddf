//! Password-based authenticated encryption of config archives.
//!
//! Layout of an encrypted blob:
//!
//! ```text
//! "Salted__" | salt (16) | "Nonce___" | nonce (12) | ciphertext + tag
//! ```
//!
//! The key is PBKDF2-HMAC-SHA256 over the password and salt. Both labels are
//! checked on decryption so truncated or foreign data fails early.

use crate::error::{CoreError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::Sha256;

const SALT_LABEL: &[u8; 8] = b"Salted__";
const NONCE_LABEL: &[u8; 8] = b"Nonce___";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

const HEADER_LEN: usize = SALT_LABEL.len() + SALT_LEN + NONCE_LABEL.len() + NONCE_LEN;

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

fn cipher(password: &str, salt: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(&derive_key(password, salt))
        .map_err(|e| CoreError::Crypto(format!("bad key length: {e}")))
}

/// Encrypt `plaintext` with a key derived from `password`.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let ciphertext = cipher(password, &salt)?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CoreError::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(SALT_LABEL);
    out.extend_from_slice(&salt);
    out.extend_from_slice(NONCE_LABEL);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`encrypt`].
///
/// # Errors
/// [`CoreError::Crypto`] if the header is malformed or authentication fails,
/// which is what a wrong password produces.
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    if data.len() < HEADER_LEN {
        return Err(CoreError::Crypto(format!(
            "encrypted data too short: {} bytes",
            data.len()
        )));
    }

    let (label, rest) = data.split_at(SALT_LABEL.len());
    if label != SALT_LABEL {
        return Err(CoreError::Crypto("missing salt label".into()));
    }
    let (salt, rest) = rest.split_at(SALT_LEN);
    let (label, rest) = rest.split_at(NONCE_LABEL.len());
    if label != NONCE_LABEL {
        return Err(CoreError::Crypto("missing nonce label".into()));
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    cipher(password, salt)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CoreError::Crypto("authentication failed".into()))
}

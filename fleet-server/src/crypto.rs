//! Secret hashing, HMAC primitives, and the agent-secret vault.
//!
//! Each registered machine's secret is stored twice: as a SHA-256 hash used
//! to authenticate re-registration, and as AES-256-GCM ciphertext so the
//! plaintext can be recovered for envelope HMAC operations. Both columns
//! must always correspond to the same plaintext; [`SecretVault`] is the only
//! writer of either.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// AES-GCM standard 96-bit nonce, prepended to the ciphertext.
const IV_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("malformed ciphertext")]
    Malformed,
}

/// Hex SHA-256 of arbitrary bytes. Used for secret hashes and key
/// derivation.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex HMAC-SHA256 tag.
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Timing-safe verification of a hex HMAC-SHA256 tag.
pub fn hmac_sha256_verify(key: &[u8], message: &[u8], tag_hex: &str) -> bool {
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.verify_slice(&tag).is_ok()
}

/// Encrypts and decrypts agent registration secrets under a key derived
/// from the server master secret (`SHA256(master)`).
pub struct SecretVault {
    cipher: Aes256Gcm,
}

impl SecretVault {
    pub fn new(master_secret: &str) -> Self {
        let key_bytes = Sha256::digest(master_secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Returns `hex(iv || ciphertext)`. A fresh random IV per call means
    /// two encryptions of the same plaintext never collide.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(hex::encode(blob))
    }

    pub fn decrypt(&self, blob_hex: &str) -> Result<String, CryptoError> {
        let blob = hex::decode(blob_hex).map_err(|_| CryptoError::Malformed)?;
        if blob.len() <= IV_LEN {
            return Err(CryptoError::Malformed);
        }
        let (iv, ciphertext) = blob.split_at(IV_LEN);
        let nonce = Nonce::from_slice(iv);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }
}

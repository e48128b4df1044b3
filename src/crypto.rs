//! AES-GCM token encryption, bcrypt password hashing, ASCII85 token
//! encoding.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

/// The token-encryption key is 16 bytes (AES-128-GCM), matching the
/// original's `crypto.RandomKey(16)` call at server startup.
pub const KEY_LEN: usize = 16;
pub const BCRYPT_COST: u32 = 12;

#[derive(Debug, Error)]
pub enum Error {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext too short")]
    Truncated,
    #[error("ascii85 decode error")]
    Ascii85,
    #[error("bcrypt error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypts `plaintext` under `key`, prepending the 12-byte nonce to the
/// ciphertext the way the AES-GCM envelope on the wire expects.
pub fn aes_encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut out = nonce_bytes.to_vec();
    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| Error::Encrypt)?;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn aes_decrypt(ciphertext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    if ciphertext.len() < 12 {
        return Err(Error::Truncated);
    }
    let (nonce_bytes, body) = ciphertext.split_at(12);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher.decrypt(nonce, body).map_err(|_| Error::Decrypt)
}

pub fn hash_password(password: &str) -> Result<String> {
    Ok(bcrypt::hash(password, BCRYPT_COST)?)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

pub fn encode_token(data: &[u8]) -> String {
    ascii85::encode(data)
}

pub fn decode_token(text: &str) -> Result<Vec<u8>> {
    ascii85::decode(text).map_err(|_| Error::Ascii85)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_roundtrip() {
        let key = random_key();
        let plaintext = b"hello session token";
        let ciphertext = aes_encrypt(plaintext, &key).unwrap();
        let decrypted = aes_decrypt(&ciphertext, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_rejects_wrong_key() {
        let key = random_key();
        let other = random_key();
        let ciphertext = aes_encrypt(b"secret", &key).unwrap();
        assert!(aes_decrypt(&ciphertext, &other).is_err());
    }

    #[test]
    fn bcrypt_roundtrip() {
        let hash = hash_password("swordfish").unwrap();
        assert!(verify_password("swordfish", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn ascii85_roundtrip() {
        let data = b"arbitrary binary token payload";
        let encoded = encode_token(data);
        let decoded = decode_token(&encoded).unwrap();
        assert_eq!(decoded, data);
    }
}

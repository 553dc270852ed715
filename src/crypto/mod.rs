//! Encryption of cold-tier objects
//!
//! AES-256-GCM with a random nonce prepended to the ciphertext. Each
//! partition gets its own key, derived from the configured master key with
//! HKDF-SHA256, so a leaked partition key exposes nothing else.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// AES-256-GCM encryption key size
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM
pub const NONCE_SIZE: usize = 12;

/// Encrypt data using AES-256-GCM
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt data produced by `encrypt`
pub fn decrypt(key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

    let (nonce, encrypted) = ciphertext.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), encrypted)
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}

/// Generate a random master key
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Derive the object key of one partition from the master key
pub fn derive_partition_key(
    master: &[u8; KEY_SIZE],
    partition: &str,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let info = format!("memrag/partition/{}", partition);
    hk.expand(info.as_bytes(), key.as_mut())
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = generate_key();
        let plaintext = b"{\"content\":\"prefers dark mode\"}";

        let ciphertext = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &ciphertext).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let ciphertext = encrypt(&generate_key(), b"Secret message").unwrap();
        assert!(decrypt(&generate_key(), &ciphertext).is_err());
    }

    #[test]
    fn test_decrypt_truncated() {
        assert!(matches!(
            decrypt(&generate_key(), &[0u8; 4]),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_partition_keys_differ() {
        let master = generate_key();
        let a = derive_partition_key(&master, "alice").unwrap();
        let b = derive_partition_key(&master, "bob").unwrap();
        assert_ne!(*a, *b);
        assert_eq!(*a, *derive_partition_key(&master, "alice").unwrap());
    }
}

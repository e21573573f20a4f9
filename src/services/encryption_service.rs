use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;

const NONCE_SIZE: usize = 12; // AES-GCM standard nonce size

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Invalid hex key: {0}")]
    InvalidHexKey(String),
    #[error("Encryption key must be 32 bytes (256 bits) long")]
    InvalidKeyLength,
}

/// Symmetric encryption of persisted plugin state (tokens, SMTP passwords, subscriber lists).
/// Uses AES-256-GCM; each ciphertext carries its own random nonce.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?,
        })
    }

    /// Builds the service from the hex string found in the server configuration.
    pub fn from_hex(key_hex: &str) -> Result<Self, EncryptionError> {
        let key_bytes =
            hex::decode(key_hex.trim()).map_err(|e| EncryptionError::InvalidHexKey(e.to_string()))?;
        Self::new(&key_bytes)
    }

    /// Prepends the 12-byte nonce to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, encrypted_data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if encrypted_data.len() < NONCE_SIZE {
            return Err(EncryptionError::DecryptionFailed(
                "Ciphertext is too short to contain a nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_encrypt_decrypt_success() {
        let service = EncryptionService::from_hex(KEY_HEX).unwrap();
        let plain = br#"{"token":"123:abc"}"#;

        let encrypted = service.encrypt(plain).unwrap();
        assert_ne!(&encrypted[NONCE_SIZE..], plain.as_slice());
        assert_eq!(service.decrypt(&encrypted).unwrap(), plain.to_vec());

        // Fresh nonce every time.
        assert_ne!(service.encrypt(plain).unwrap(), encrypted);
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let key2_hex = "f1e1d1c1b1a191817161514131211101f0e0d0c0b0a090807060504030201000";
        let encrypted = EncryptionService::from_hex(KEY_HEX)
            .unwrap()
            .encrypt(b"another secret")
            .unwrap();

        let result = EncryptionService::from_hex(key2_hex)
            .unwrap()
            .decrypt(&encrypted);
        assert!(matches!(result, Err(EncryptionError::DecryptionFailed(_))));
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            EncryptionService::from_hex("1234"),
            Err(EncryptionError::InvalidKeyLength)
        ));
        assert!(matches!(
            EncryptionService::from_hex("not-a-hex-string"),
            Err(EncryptionError::InvalidHexKey(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let service = EncryptionService::from_hex(KEY_HEX).unwrap();
        assert!(matches!(
            service.decrypt(&[0u8; 5]),
            Err(EncryptionError::DecryptionFailed(_))
        ));
    }
}

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use tracing::warn;

const NONCE_LEN: usize = 12;
const DEFAULT_KEY: &[u8; 32] = b"fieldsync-default-key-32-bytes!!";

/// AES-256-GCM encryption of queued payloads before they hit SQLite.
/// Stored form: base64(nonce || ciphertext).
pub struct PayloadEncryption {
    cipher: Aes256Gcm,
}

impl PayloadEncryption {
    /// `key_hex` must decode to exactly 32 bytes. Without a key the built-in
    /// default is used, which only protects against casual inspection.
    pub fn new(key_hex: Option<&str>) -> Result<Self, String> {
        let key = match key_hex {
            Some(k) => hex::decode(k).map_err(|e| format!("Encryption key is not hex: {}", e))?,
            None => {
                warn!("[DB] No payload encryption key configured, using built-in default");
                DEFAULT_KEY.to_vec()
            }
        };

        let key_array: [u8; 32] = key
            .try_into()
            .map_err(|_| "Encryption key must be 32 bytes".to_string())?;

        Ok(Self {
            cipher: Aes256Gcm::new(&key_array.into()),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(&result))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, String> {
        let data = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| format!("Base64 decode failed: {}", e))?;

        if data.len() < NONCE_LEN {
            return Err("Invalid encrypted data length".to_string());
        }

        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|e| format!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| format!("UTF-8 decode failed: {}", e))
    }
}

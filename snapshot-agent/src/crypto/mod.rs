//! AES-256-GCM encryption of sensitive files.
//!
//! Every call draws a fresh random nonce, so encrypting the same plaintext
//! twice yields different ciphertext. The key is loaded once per process and
//! never written into an artifact.

use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::utils::{EngineError, Result};

/// Algorithm name recorded in every payload and manifest
pub const ALGORITHM: &str = "aes-256-gcm";

/// Suffix appended to the relative path of an encrypted file
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Raw key bytes, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Decode a base64-encoded 32-byte key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EngineError::Config(format!("Encryption key is not valid base64: {}", e)))?;

        if bytes.len() != KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            return Err(EngineError::Config(format!(
                "Encryption key must be {} bytes, got {}",
                KEY_SIZE, len
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    /// Fresh random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(***)")
    }
}

/// One encrypted file as persisted in `<path>.encrypted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub algorithm: String,
    /// Base64 nonce
    pub nonce: String,
    /// Base64 authentication tag
    pub auth_tag: String,
    /// Base64 ciphertext without the tag
    pub ciphertext: String,
}

impl EncryptedPayload {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Integrity(format!("Malformed encrypted payload: {}", e)))
    }
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| EngineError::Integrity(format!("Invalid {} encoding: {}", name, e)))?;
    match expected_len {
        Some(len) if bytes.len() != len => Err(EngineError::Integrity(format!(
            "Invalid {} size: expected {}, got {}",
            name,
            len,
            bytes.len()
        ))),
        _ => Ok(bytes),
    }
}

/// Encrypts and decrypts payloads with a single process-wide key
#[derive(Clone)]
pub struct EncryptionManager {
    cipher: Aes256Gcm,
}

impl fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("algorithm", &ALGORITHM)
            .finish()
    }
}

impl EncryptionManager {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    /// Load the key from an environment variable.
    ///
    /// An unset variable yields `Ok(None)`; a malformed key is a configuration error.
    pub fn from_env(var: &str) -> Result<Option<Self>> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => {
                let key = EncryptionKey::from_base64(&value)?;
                Ok(Some(Self::new(&key)))
            }
            _ => Ok(None),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut buffer = plaintext.to_vec();

        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", &mut buffer)
            .map_err(|e| EngineError::Encryption(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedPayload {
            algorithm: ALGORITHM.to_string(),
            nonce: STANDARD.encode(nonce),
            auth_tag: STANDARD.encode(tag),
            ciphertext: STANDARD.encode(&buffer),
        })
    }

    /// Decrypt a payload; any tampering surfaces as `EngineError::Integrity`.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        if payload.algorithm != ALGORITHM {
            return Err(EngineError::Integrity(format!(
                "Unsupported algorithm: {}",
                payload.algorithm
            )));
        }

        let nonce = decode_field("nonce", &payload.nonce, Some(NONCE_SIZE))?;
        let tag = decode_field("auth tag", &payload.auth_tag, Some(TAG_SIZE))?;
        let mut buffer = decode_field("ciphertext", &payload.ciphertext, None)?;

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| {
                EngineError::Integrity("Authentication tag mismatch: wrong key or corrupted data".into())
            })?;

        Ok(buffer)
    }

    /// Encrypt `source` into a JSON payload at `dest`
    pub fn encrypt_file(&self, source: &Path, dest: &Path) -> Result<()> {
        let mut plaintext = std::fs::read(source)?;
        let payload = self.encrypt(&plaintext);
        plaintext.zeroize();
        std::fs::write(dest, payload?.to_json()?)?;
        Ok(())
    }

    /// Decrypt the JSON payload at `source` into `dest`
    pub fn decrypt_file(&self, source: &Path, dest: &Path) -> Result<()> {
        let payload = EncryptedPayload::from_json(&std::fs::read(source)?)?;
        let plaintext = self.decrypt(&payload)?;
        std::fs::write(dest, plaintext)?;
        Ok(())
    }
}

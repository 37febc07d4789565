//! AES-256-GCM envelope encryption.
//!
//! The serialized envelope is a small JSON document with base64 fields, so
//! it can live in a TEXT column and survive being copied between stores.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

/// Size of an encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of a GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// A data key encrypted under the master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Base64 ciphertext of the 32-byte data key
    pub ciphertext: String,
    /// Base64 nonce used when wrapping
    pub nonce: String,
}

/// Key backend that wraps and unwraps per-record data keys.
///
/// The local implementation holds the master key in memory; a deployment
/// backed by a managed KMS implements the same two calls over the network.
/// Implementations must fail on any integrity error — an unwrap that
/// cannot authenticate its input returns `Err`, never a default key.
pub trait MasterKey: Send + Sync {
    fn wrap(&self, data_key: &[u8]) -> Result<WrappedKey>;
    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Vec<u8>>;
}

/// Master key held in process memory, loaded from a base64 env value.
pub struct LocalMasterKey {
    key: Vec<u8>,
}

impl LocalMasterKey {
    /// Decode and validate a base64-encoded 32-byte master key.
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_base64)
            .context("Failed to decode base64 master key")?;

        if key.len() != KEY_SIZE {
            return Err(anyhow!(
                "Master key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            ));
        }

        Ok(Self { key })
    }
}

impl MasterKey for LocalMasterKey {
    fn wrap(&self, data_key: &[u8]) -> Result<WrappedKey> {
        let (ciphertext, nonce) = encrypt_bytes(data_key, &self.key)?;
        Ok(WrappedKey { ciphertext, nonce })
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Vec<u8>> {
        decrypt_bytes(&wrapped.ciphertext, &wrapped.nonce, &self.key)
    }
}

/// Serialized envelope: wrapped data key plus payload ciphertext.
#[derive(Serialize, Deserialize)]
struct Envelope {
    wrapped_key: WrappedKey,
    /// Base64 ciphertext of the payload
    ciphertext: String,
    /// Base64 nonce used for the payload
    nonce: String,
}

/// Stateless seal/open facade over a [`MasterKey`] backend.
pub struct EnvelopeCipher {
    master: std::sync::Arc<dyn MasterKey>,
}

impl EnvelopeCipher {
    pub fn new(master: std::sync::Arc<dyn MasterKey>) -> Self {
        Self { master }
    }

    /// Encrypts plaintext under a fresh data key and returns the JSON
    /// envelope.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let data_key = Aes256Gcm::generate_key(&mut OsRng);

        let (ciphertext, nonce) = encrypt_bytes(plaintext.as_bytes(), &data_key)?;
        let wrapped_key = self
            .master
            .wrap(&data_key)
            .context("Failed to wrap data key")?;

        let envelope = Envelope {
            wrapped_key,
            ciphertext,
            nonce,
        };

        serde_json::to_string(&envelope).context("Failed to serialize envelope")
    }

    /// Decrypts a JSON envelope produced by [`seal`](Self::seal).
    ///
    /// Fails on any malformed encoding, unwrap failure, or payload
    /// authentication failure.
    pub fn open(&self, blob: &str) -> Result<String> {
        let envelope: Envelope =
            serde_json::from_str(blob).context("Failed to parse envelope")?;

        let data_key = self
            .master
            .unwrap(&envelope.wrapped_key)
            .context("Failed to unwrap data key")?;

        let plaintext = decrypt_bytes(&envelope.ciphertext, &envelope.nonce, &data_key)?;
        String::from_utf8(plaintext).context("Decrypted payload is not valid UTF-8")
    }
}

/// Encrypts bytes with AES-256-GCM and a random nonce.
///
/// Returns (ciphertext, nonce), both base64-encoded.
fn encrypt_bytes(plaintext: &[u8], key: &[u8]) -> Result<(String, String)> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Random nonce, never reused
    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(&nonce_bytes, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok((BASE64.encode(&ciphertext_bytes), BASE64.encode(nonce_bytes)))
}

/// Decrypts base64 ciphertext with AES-256-GCM.
///
/// Fails if the key or nonce does not match or the ciphertext was tampered.
fn decrypt_bytes(ciphertext: &str, nonce: &str, key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let ciphertext_bytes = BASE64
        .decode(ciphertext)
        .context("Failed to decode ciphertext")?;
    let nonce_bytes = BASE64.decode(nonce).context("Failed to decode nonce")?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let nonce = Nonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext_bytes.as_ref())
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))
}

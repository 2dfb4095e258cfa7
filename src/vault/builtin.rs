use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

use super::CryptoError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MAX_KEY_ID_LEN: usize = 32;

/// A 256-bit AES-GCM data key together with its id.
///
/// Key bytes are zeroed on drop.
pub struct DataKey {
    id: String,
    bytes: [u8; 32],
}

impl DataKey {
    pub fn new(id: &str, bytes: [u8; 32]) -> Result<Self, CryptoError> {
        validate_key_id(id)?;
        Ok(Self {
            id: id.to_string(),
            bytes,
        })
    }

    /// Parse a key from 64 hex characters.
    pub fn from_hex(id: &str, hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = parse_key_hex(hex_key)?;
        Self::new(id, bytes)
    }

    /// Parse the `<key_id>:<64 hex chars>` form used in configuration.
    pub fn parse_spec(spec: &str) -> Result<Self, CryptoError> {
        let (id, hex_key) = spec
            .trim()
            .split_once(':')
            .ok_or_else(|| CryptoError::InvalidKey("expected <key_id>:<hex>".into()))?;
        Self::from_hex(id, hex_key)
    }

    /// Generate a fresh random key.
    pub fn generate(id: &str) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::new(id, bytes)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hex encoding of the key material, for `keys generate` output.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid key length: {:?}", e)))
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("id", &self.id)
            .field("bytes", &"[redacted]")
            .finish()
    }
}

/// Encrypt `plaintext` under `key`.
///
/// A fresh random nonce is drawn on every call, so sealing the same
/// plaintext twice yields two different ciphertexts.
pub fn encrypt(plaintext: &[u8], key: &DataKey) -> Result<String, CryptoError> {
    let cipher = key.cipher()?;
    let nonce_bytes = generate_nonce();
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: key.id.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&sealed);

    Ok(format!(
        "{}.{}",
        key.id,
        base64::engine::general_purpose::STANDARD.encode(blob)
    ))
}

/// Decrypt a ciphertext produced by [`encrypt`] with the same key.
pub fn decrypt(ciphertext: &str, key: &DataKey) -> Result<Vec<u8>, CryptoError> {
    let (key_id, blob) = split_ciphertext(ciphertext)?;
    if key_id != key.id {
        return Err(CryptoError::DecryptionFailed);
    }
    open(&blob, key)
}

/// Split `<key_id>.<base64>` into its key id and decoded blob.
pub(crate) fn split_ciphertext(ciphertext: &str) -> Result<(&str, Vec<u8>), CryptoError> {
    let (key_id, encoded) = ciphertext
        .split_once('.')
        .ok_or(CryptoError::DecryptionFailed)?;
    if validate_key_id(key_id).is_err() {
        return Err(CryptoError::DecryptionFailed);
    }
    let blob = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    Ok((key_id, blob))
}

pub(crate) fn open(blob: &[u8], key: &DataKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = key.cipher()?;
    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: key.id.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn validate_key_id(id: &str) -> Result<(), CryptoError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_KEY_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CryptoError::InvalidKey(format!(
            "key id must be 1-{} chars of [A-Za-z0-9_-], got '{}'",
            MAX_KEY_ID_LEN, id
        )))
    }
}

pub fn parse_key_hex(hex_key: &str) -> Result<[u8; 32], CryptoError> {
    let hex_key = hex_key.trim();
    if hex_key.len() != 64 {
        return Err(CryptoError::InvalidKey(format!(
            "data key must be 64 hex chars (32 bytes), got {} chars",
            hex_key.len()
        )));
    }
    let bytes = hex::decode(hex_key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

use std::collections::HashMap;

use super::builtin::{self, DataKey};
use super::CryptoError;

/// The set of data keys the relay holds.
///
/// New payloads are always sealed under the active key. Retired keys are
/// kept decrypt-only for the length of a rotation window; once a retired key
/// is dropped from configuration, anything sealed under it is permanently
/// undecryptable.
pub struct Keyring {
    active: DataKey,
    retired: HashMap<String, DataKey>,
}

impl Keyring {
    pub fn new(active: DataKey) -> Self {
        Self {
            active,
            retired: HashMap::new(),
        }
    }

    /// Add a decrypt-only key. Fails if its id collides with another key.
    pub fn with_retired(mut self, key: DataKey) -> Result<Self, CryptoError> {
        if key.id() == self.active.id() || self.retired.contains_key(key.id()) {
            return Err(CryptoError::InvalidKey(format!(
                "duplicate key id '{}'",
                key.id()
            )));
        }
        self.retired.insert(key.id().to_string(), key);
        Ok(self)
    }

    pub fn active_key_id(&self) -> &str {
        self.active.id()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        builtin::encrypt(plaintext, &self.active)
    }

    /// Decrypt with whichever held key the ciphertext names.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        let (key_id, blob) = builtin::split_ciphertext(ciphertext)?;
        let key = if key_id == self.active.id() {
            &self.active
        } else {
            self.retired
                .get(key_id)
                .ok_or(CryptoError::DecryptionFailed)?
        };
        builtin::open(&blob, key)
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut retired: Vec<&String> = self.retired.keys().collect();
        retired.sort();
        f.debug_struct("Keyring")
            .field("active", &self.active.id())
            .field("retired", &retired)
            .finish()
    }
}

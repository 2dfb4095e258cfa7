//! Payload encryption.
//!
//! Payloads are sealed with AES-256-GCM under a server-held data key. Every
//! ciphertext carries the id of the key that sealed it so that keys can be
//! rotated without losing in-flight jobs:
//!
//! ```text
//! <key_id>.<base64(nonce ‖ ciphertext ‖ tag)>
//! ```
//!
//! The key id is authenticated as associated data, so relabelling a
//! ciphertext with another key id fails decryption like any other tampering.

pub mod builtin;
pub mod keyring;

pub use builtin::{decrypt, encrypt, DataKey};
pub use keyring::Keyring;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Malformed, truncated, tampered, or sealed under a key we don't hold.
    /// Deliberately carries no detail.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

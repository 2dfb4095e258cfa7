//! Credential issuance and subject secret hashing.
//!
//! Two tiers of trust:
//! - short-lived EdDSA access credentials, verified statelessly per request;
//! - long-lived opaque refresh tokens, persisted in the credential store so
//!   they can be revoked by deleting the record.

pub mod credentials;
pub mod password;

pub use credentials::{Claims, CredentialError, CredentialService, IssuedCredential, RefreshToken};

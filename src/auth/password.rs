//! Subject secret hashing and verification using argon2id.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

/// Hash a secret using argon2id with a random salt.
pub fn hash_secret(secret: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(secret.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a secret against a stored argon2id hash.
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(secret.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_secret("p1").unwrap();
        assert!(verify_secret("p1", &hash).unwrap());
        assert!(!verify_secret("p2", &hash).unwrap());
    }

    #[test]
    fn same_secret_different_hashes() {
        assert_ne!(hash_secret("p1").unwrap(), hash_secret("p1").unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(verify_secret("p1", "not-a-phc-string").is_err());
    }
}

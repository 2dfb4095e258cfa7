use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// Bad signature, wrong algorithm, missing claims, or not a JWT at all.
    #[error("invalid credential")]
    Invalid,

    #[error("credential expired")]
    Expired,

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("failed to sign credential: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by an access credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id.
    pub sub: String,
    /// Unique token id.
    pub jti: String,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expires at (unix seconds).
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Opaque, unsigned refresh token. Only meaningful while a matching record
/// exists in the credential store.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies EdDSA (Ed25519) signed access credentials.
#[derive(Clone)]
pub struct CredentialService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl CredentialService {
    /// Build from an Ed25519 private key in PKCS#8 v2 DER form.
    /// The verifying key is derived from it.
    pub fn from_pkcs8(
        pkcs8: &[u8],
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, CredentialError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        Ok(Self {
            encoding_key: EncodingKey::from_ed_der(pkcs8),
            decoding_key: DecodingKey::from_ed_der(key_pair.public_key().as_ref()),
            access_ttl,
            refresh_ttl,
        })
    }

    /// Build from the base64 PKCS#8 form used in configuration.
    pub fn from_base64(
        encoded: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, CredentialError> {
        let der = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Self::from_pkcs8(&der, access_ttl, refresh_ttl)
    }

    /// Issue an access credential for `subject_id`, valid from now.
    pub fn issue(&self, subject_id: &str) -> Result<IssuedCredential, CredentialError> {
        self.issue_at(subject_id, Utc::now())
    }

    /// Issue an access credential with an explicit issue instant.
    pub fn issue_at(
        &self,
        subject_id: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<IssuedCredential, CredentialError> {
        let expires_at = issued_at + self.access_ttl;
        let claims = Claims {
            sub: subject_id.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::EdDSA),
            &claims,
            &self.encoding_key,
        )?;

        Ok(IssuedCredential { token, expires_at })
    }

    /// Verify signature and expiry. Returns the credential's claims.
    pub fn verify(&self, token: &str) -> Result<Claims, CredentialError> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Invalid,
            })?;

        if data.claims.sub.is_empty() {
            return Err(CredentialError::Invalid);
        }
        Ok(data.claims)
    }

    /// Verify and return just the subject id.
    pub fn verify_subject(&self, token: &str) -> Result<String, CredentialError> {
        self.verify(token).map(|claims| claims.sub)
    }

    /// Generate a random opaque refresh token.
    pub fn issue_refresh(&self) -> RefreshToken {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        RefreshToken {
            token: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes),
            expires_at: Utc::now() + self.refresh_ttl,
        }
    }
}

/// Generate a fresh Ed25519 signing key as a PKCS#8 v2 document.
pub fn generate_signing_key() -> Result<Vec<u8>, CredentialError> {
    let rng = ring::rand::SystemRandom::new();
    let document = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| CredentialError::InvalidKey("key generation failed".into()))?;
    Ok(document.as_ref().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CredentialService {
        let key = generate_signing_key().unwrap();
        CredentialService::from_pkcs8(&key, Duration::minutes(15), Duration::days(7)).unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let svc = service();
        let issued = svc.issue("u1").unwrap();

        let claims = svc.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        assert!(!claims.jti.is_empty());
        assert_eq!(claims.exp, issued.expires_at.timestamp());
    }

    #[test]
    fn test_each_credential_has_unique_id() {
        let svc = service();
        let a = svc.verify(&svc.issue("u1").unwrap().token).unwrap();
        let b = svc.verify(&svc.issue("u1").unwrap().token).unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn test_expired_credential_rejected() {
        let svc = service();
        let issued = svc
            .issue_at("u1", Utc::now() - Duration::minutes(20))
            .unwrap();
        assert!(matches!(svc.verify(&issued.token), Err(CredentialError::Expired)));
    }

    #[test]
    fn test_foreign_key_pair_rejected() {
        let ours = service();
        let theirs = service();
        let token = theirs.issue("u1").unwrap().token;
        assert!(matches!(ours.verify(&token), Err(CredentialError::Invalid)));
    }

    #[test]
    fn test_symmetric_algorithm_rejected() {
        let svc = service();
        let now = Utc::now().timestamp();
        let forged = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                sub: "u1".into(),
                jti: "x".into(),
                iat: now,
                exp: now + 600,
            },
            &EncodingKey::from_secret(b"guessable"),
        )
        .unwrap();
        assert!(matches!(svc.verify(&forged), Err(CredentialError::Invalid)));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let svc = service();
        for token in ["", "not-a-jwt", "a.b.c", "invalid.token.here"] {
            assert!(matches!(svc.verify(token), Err(CredentialError::Invalid)));
        }
    }

    #[test]
    fn test_refresh_tokens_are_random_and_long_lived() {
        let svc = service();
        let a = svc.issue_refresh();
        let b = svc.issue_refresh();
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), 43);
        assert!(a.expires_at > Utc::now() + Duration::days(6));
        // Opaque, not a signed credential.
        assert!(svc.verify(&a.token).is_err());
    }

    #[test]
    fn test_from_base64_roundtrip() {
        let key = generate_signing_key().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&key);
        let svc =
            CredentialService::from_base64(&encoded, Duration::minutes(5), Duration::days(1))
                .unwrap();
        let token = svc.issue("u2").unwrap().token;
        assert_eq!(svc.verify_subject(&token).unwrap(), "u2");
    }

    #[test]
    fn test_rejects_garbage_key() {
        assert!(CredentialService::from_pkcs8(b"nope", Duration::minutes(5), Duration::days(1)).is_err());
    }
}

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;

use crate::auth::credentials::{self, CredentialService};
use crate::jobs::relay::RetryPolicy;
use crate::vault::{DataKey, Keyring};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Namespace for every Redis key the relay owns.
    pub key_prefix: String,
    /// Base64 PKCS#8 Ed25519 key. `None` outside production means an
    /// ephemeral key is generated per process.
    pub signing_key: Option<String>,
    /// Active data key as `<kid>:<64 hex>`. `None` outside production means an
    /// ephemeral key is generated per process.
    pub data_key: Option<String>,
    /// Decrypt-only keys, same format as `data_key`.
    pub retired_keys: Vec<String>,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub delivery_timeout_secs: u64,
    pub visibility_timeout_secs: u64,
    /// How long terminal job records stay queryable.
    pub archive_ttl_secs: u64,
    /// Signs outbound bodies (`x-relay-signature`) when set.
    pub delivery_signing_secret: Option<String>,
    pub cors_origin: Option<String>,
    pub production: bool,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff_ms: self.backoff_base_ms,
            max_backoff_ms: self.backoff_max_ms,
            ..RetryPolicy::default()
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn archive_ttl(&self) -> Duration {
        Duration::from_secs(self.archive_ttl_secs)
    }

    pub fn credential_service(&self) -> anyhow::Result<CredentialService> {
        let access_ttl = chrono::Duration::seconds(self.access_ttl_secs as i64);
        let refresh_ttl = chrono::Duration::seconds(self.refresh_ttl_secs as i64);

        match self.signing_key {
            Some(ref encoded) => CredentialService::from_base64(encoded, access_ttl, refresh_ttl)
                .context("RELAY_SIGNING_KEY is not a valid base64 PKCS#8 Ed25519 key"),
            None => {
                tracing::warn!(
                    "RELAY_SIGNING_KEY is not set, using an ephemeral signing key. \
                     Credentials will not survive a restart."
                );
                let der = credentials::generate_signing_key()?;
                Ok(CredentialService::from_pkcs8(&der, access_ttl, refresh_ttl)?)
            }
        }
    }

    pub fn keyring(&self) -> anyhow::Result<Keyring> {
        let active = match self.data_key {
            Some(ref spec) => DataKey::parse_spec(spec)
                .context("RELAY_DATA_KEY must look like <kid>:<64 hex chars>")?,
            None => {
                tracing::warn!(
                    "RELAY_DATA_KEY is not set, using an ephemeral data key. \
                     Payloads encrypted elsewhere will fail to decrypt."
                );
                DataKey::generate("ephemeral")?
            }
        };

        let mut keyring = Keyring::new(active);
        for spec in &self.retired_keys {
            let key = DataKey::parse_spec(spec)
                .context("RELAY_RETIRED_KEYS entries must look like <kid>:<64 hex chars>")?;
            keyring = keyring.with_retired(key)?;
        }
        Ok(keyring)
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_vars(|name| std::env::var(name).ok())
}

/// Build a config from any variable source.
pub fn from_vars<F>(get: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| get(name).filter(|v| !v.trim().is_empty());

    let env_mode = get("RELAY_ENV").or_else(|| get("RUST_ENV")).unwrap_or_default();
    let production = env_mode == "production";

    let signing_key = get("RELAY_SIGNING_KEY");
    let data_key = get("RELAY_DATA_KEY");
    if production {
        if signing_key.is_none() {
            anyhow::bail!("RELAY_SIGNING_KEY must be set in production (see `relay keys generate`)");
        }
        if data_key.is_none() {
            anyhow::bail!("RELAY_DATA_KEY must be set in production (see `relay keys generate`)");
        }
        if let Some(ref key) = signing_key {
            base64::engine::general_purpose::STANDARD
                .decode(key.trim())
                .context("RELAY_SIGNING_KEY is not valid base64")?;
        }
    }

    let cfg = Config {
        port: parse(&get, "RELAY_PORT", 8080)?,
        redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
        key_prefix: get("RELAY_KEY_PREFIX").unwrap_or_else(|| "relay".into()),
        signing_key,
        data_key,
        retired_keys: get("RELAY_RETIRED_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        access_ttl_secs: parse(&get, "RELAY_ACCESS_TTL_SECS", 900)?,
        refresh_ttl_secs: parse(&get, "RELAY_REFRESH_TTL_SECS", 604_800)?,
        workers: parse(&get, "RELAY_WORKERS", 4)?,
        max_attempts: parse(&get, "RELAY_MAX_ATTEMPTS", 5)?,
        backoff_base_ms: parse(&get, "RELAY_BACKOFF_BASE_MS", 2_000)?,
        backoff_max_ms: parse(&get, "RELAY_BACKOFF_MAX_MS", 300_000)?,
        delivery_timeout_secs: parse(&get, "RELAY_DELIVERY_TIMEOUT_SECS", 10)?,
        visibility_timeout_secs: parse(&get, "RELAY_VISIBILITY_TIMEOUT_SECS", 60)?,
        archive_ttl_secs: parse(&get, "RELAY_ARCHIVE_TTL_SECS", 604_800)?,
        delivery_signing_secret: get("RELAY_DELIVERY_SIGNING_SECRET"),
        cors_origin: get("RELAY_CORS_ORIGIN"),
        production,
    };

    // A timed-out delivery must get at least one retry before going terminal.
    if cfg.max_attempts < 2 {
        anyhow::bail!("RELAY_MAX_ATTEMPTS must be at least 2, got {}", cfg.max_attempts);
    }
    if cfg.visibility_timeout_secs <= cfg.delivery_timeout_secs {
        anyhow::bail!(
            "RELAY_VISIBILITY_TIMEOUT_SECS ({}) must exceed RELAY_DELIVERY_TIMEOUT_SECS ({})",
            cfg.visibility_timeout_secs,
            cfg.delivery_timeout_secs
        );
    }

    Ok(cfg)
}

fn parse<T, F>(get: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", name, raw, e)),
        None => Ok(default),
    }
}

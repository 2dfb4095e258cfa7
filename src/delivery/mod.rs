//! Outbound delivery of decrypted payloads to job targets.

use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::queue::RelayJob;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery timed out")]
    Timeout,

    #[error("delivery request failed: {0}")]
    Network(String),

    #[error("target responded with status {0}")]
    Status(u16),

    #[error("failed to encode delivery body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Timeouts, network errors and non-2xx answers may succeed later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Encode(_))
    }

    /// Short label for the `result` metric dimension.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryError::Timeout => "timeout",
            DeliveryError::Network(_) => "network",
            DeliveryError::Status(_) => "status",
            DeliveryError::Encode(_) => "encode",
        }
    }
}

/// JSON body POSTed to the target.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryBody<'a> {
    pub data: String,
    pub subject_id: &'a str,
    /// Present only when `data` is base64 because the plaintext was not UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<&'static str>,
}

impl<'a> DeliveryBody<'a> {
    pub fn new(plaintext: &[u8], subject_id: &'a str) -> Self {
        match std::str::from_utf8(plaintext) {
            Ok(text) => Self {
                data: text.to_string(),
                subject_id,
                encoding: None,
            },
            Err(_) => Self {
                data: base64::engine::general_purpose::STANDARD.encode(plaintext),
                subject_id,
                encoding: Some("base64"),
            },
        }
    }
}

/// HMAC-SHA256 of `payload` as `sha256=<hex>`.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Sends a single delivery attempt per call. Retrying is the worker's job.
#[derive(Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    signing_secret: Option<String>,
}

impl DeliveryClient {
    pub fn new(timeout: Duration, signing_secret: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relay-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            signing_secret,
        })
    }

    /// POST `plaintext` for `job` to its target. 2xx is success.
    ///
    /// The plaintext is never logged.
    pub async fn deliver(&self, job: &RelayJob, plaintext: &[u8]) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&DeliveryBody::new(plaintext, &job.subject_id))?;
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut req = self
            .client
            .post(&job.target_url)
            .header("content-type", "application/json")
            .header("x-relay-job-id", job.id.to_string())
            .header("x-relay-attempt", job.attempts.to_string())
            .header("x-relay-timestamp", &timestamp);

        if let Some(ref secret) = self.signing_secret {
            req = req.header("x-relay-signature", hmac_sha256_hex(secret, &body));
        }

        let resp = req.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            debug!(job_id = %job.id, status = %status, "target accepted delivery");
            return Ok(());
        }

        warn!(job_id = %job.id, attempt = job.attempts, status = %status, "target rejected delivery");
        Err(DeliveryError::Status(status.as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job_for(url: String) -> RelayJob {
        let mut job = RelayJob::new("k1.x".into(), "u1".into(), url);
        job.attempts = 1;
        job
    }

    #[test]
    fn test_body_for_text_payload() {
        let body = serde_json::to_value(DeliveryBody::new("héllo".as_bytes(), "u1")).unwrap();
        assert_eq!(body, serde_json::json!({"data": "héllo", "subjectId": "u1"}));
    }

    #[test]
    fn test_body_for_binary_payload_is_base64() {
        let body = serde_json::to_value(DeliveryBody::new(&[0xff, 0x00, 0xfe], "u1")).unwrap();
        assert_eq!(body["data"], "/wD+");
        assert_eq!(body["encoding"], "base64");
    }

    #[test]
    fn test_hmac_signature_deterministic() {
        let sig1 = hmac_sha256_hex("secret123", b"payload");
        let sig2 = hmac_sha256_hex("secret123", b"payload");
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));
        assert_ne!(sig1, hmac_sha256_hex("secret124", b"payload"));
    }

    #[tokio::test]
    async fn test_deliver_posts_json_body() {
        let server = MockServer::start().await;
        let job = job_for(format!("{}/hook", server.uri()));

        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(serde_json::json!({"data": "hello", "subjectId": "u1"})))
            .and(header("x-relay-job-id", job.id.to_string().as_str()))
            .and(header("x-relay-attempt", "1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::new(Duration::from_secs(5), None).unwrap();
        client.deliver(&job, b"hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_signature_header_when_secret_configured() {
        let server = MockServer::start().await;
        let job = job_for(format!("{}/hook", server.uri()));
        let expected = hmac_sha256_hex(
            "whsec",
            &serde_json::to_vec(&DeliveryBody::new(b"hello", "u1")).unwrap(),
        );

        Mock::given(method("POST"))
            .and(header_exists("x-relay-timestamp"))
            .and(header("x-relay-signature", expected.as_str()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::new(Duration::from_secs(5), Some("whsec".into())).unwrap();
        client.deliver(&job, b"hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_non_2xx_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = DeliveryClient::new(Duration::from_secs(5), None).unwrap();
        let err = client
            .deliver(&job_for(server.uri()), b"hello")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Status(503)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_target_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = DeliveryClient::new(Duration::from_millis(100), None).unwrap();
        let err = client
            .deliver(&job_for(server.uri()), b"hello")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout));
        assert_eq!(err.label(), "timeout");
    }

    #[tokio::test]
    async fn test_unreachable_target_is_network_error() {
        let client = DeliveryClient::new(Duration::from_secs(2), None).unwrap();
        let err = client
            .deliver(&job_for("http://127.0.0.1:9/hook".into()), b"hello")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Network(_)));
    }
}

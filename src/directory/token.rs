//! Service-to-service bearer tokens for the directory service.
//!
//! A token is minted for every outbound request and dropped with it; nothing
//! here caches tokens.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::util::{read_limited_bytes, BodyError};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";
const MAX_TOKEN_RESPONSE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid service name {0:?}: must be non-empty and contain no '.'")]
    InvalidService(String),
    #[error("Invalid token secret: {0}")]
    InvalidSecret(String),
    #[error("Token request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Token issuer returned status {0}")]
    HttpStatus(u16),
    #[error("Token response unreadable: {0}")]
    Body(#[from] BodyError),
    #[error("Token response malformed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Mints short-lived bearer tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<SecretString, TokenError>;
}

// ============================================================================
// Locally signed tokens
// ============================================================================

/// Mints tokens locally from a secret shared with the directory service.
///
/// Format: `v1.<service>.<expires_unix>.<nonce>.<hmac-sha256-hex>`, where
/// the HMAC is keyed with the secret and covers everything before it. The
/// nonce makes every token distinct even within the same second.
pub struct SignedTokenIssuer {
    service: String,
    /// Keyed once; cloned per signature
    mac: HmacSha256,
    ttl: Duration,
    counter: AtomicU64,
}

impl SignedTokenIssuer {
    pub fn new(
        service: impl Into<String>,
        secret: SecretString,
        ttl: Duration,
    ) -> Result<Self, TokenError> {
        let service = service.into();
        if service.is_empty() || service.contains('.') {
            return Err(TokenError::InvalidService(service));
        }
        let mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|e| TokenError::InvalidSecret(e.to_string()))?;
        Ok(Self {
            service,
            mac,
            ttl,
            counter: AtomicU64::new(0),
        })
    }

    /// Mint a token that expires `ttl` after `now` (unix seconds).
    pub fn mint_at(&self, now: i64) -> SecretString {
        let expires = now.saturating_add(self.ttl.as_secs() as i64);
        let nanos = chrono::Utc::now().timestamp_subsec_nanos();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let payload = format!(
            "{TOKEN_VERSION}.{}.{expires}.{nanos:08x}{seq:x}",
            self.service
        );
        let signature = self.sign(&payload);
        SecretString::from(format!("{payload}.{signature}"))
    }

    /// Check signature, service and expiry of a token minted with the same
    /// secret.
    pub fn verify(&self, token: &str, now: i64) -> bool {
        let Some((payload, signature)) = token.rsplit_once('.') else {
            return false;
        };
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            return false;
        }
        let mut parts = payload.split('.');
        let (Some(version), Some(service), Some(expires), Some(_nonce), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return false;
        };
        version == TOKEN_VERSION
            && service == self.service
            && expires.parse::<i64>().is_ok_and(|exp| exp > now)
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl TokenIssuer for SignedTokenIssuer {
    async fn issue(&self) -> Result<SecretString, TokenError> {
        Ok(self.mint_at(chrono::Utc::now().timestamp()))
    }
}

// ============================================================================
// Remote credential service
// ============================================================================

#[derive(Serialize)]
struct TokenRequest<'a> {
    service: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Requests tokens from an external credential-issuance service:
/// `POST <issuer_url>` with `{"service": ...}`, answered by `{"token": ...}`.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    url: String,
    service: String,
}

impl HttpTokenIssuer {
    pub fn new(client: reqwest::Client, url: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            service: service.into(),
        }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self) -> Result<SecretString, TokenError> {
        let body = serde_json::to_vec(&TokenRequest {
            service: &self.service,
        })?;
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TokenError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, MAX_TOKEN_RESPONSE).await?;
        let TokenResponse { token } = serde_json::from_slice(&bytes)?;
        Ok(SecretString::from(token))
    }
}

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::token::TokenIssuer;
use super::{DirectoryError, DiscoveredSource, SourceDirectory};
use crate::util::{normalize_source_url, read_limited_bytes, MAX_DIRECTORY_RESPONSE};

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum UserId {
    Text(String),
    Number(i64),
}

impl UserId {
    fn into_string(self) -> String {
        match self {
            UserId::Text(s) => s,
            UserId::Number(n) => n.to_string(),
        }
    }
}

/// One feed entry: either a bare URL or an object carrying one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DirectoryFeed {
    Url(String),
    Entry {
        url: String,
        #[serde(default)]
        title: Option<String>,
    },
}

/// One user record of the directory response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DirectoryUser {
    #[serde(default)]
    pub id: Option<UserId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_flagged: bool,
    /// Missing and `null` both mean "no feeds"
    #[serde(default)]
    pub feeds: Option<Vec<DirectoryFeed>>,
}

/// Output of [`flatten_users`].
#[derive(Debug, Default)]
pub(crate) struct Flattened {
    pub sources: Vec<DiscoveredSource>,
    /// Entries whose URL could not be normalized
    pub dropped: usize,
}

/// Flatten per-user feed lists into one sequence of sources.
///
/// Flagged users contribute nothing. Entries whose URL cannot be normalized
/// (malformed, not HTTP, or private without `allow_private`) are dropped.
pub(crate) fn flatten_users(users: Vec<DirectoryUser>, allow_private: bool) -> Flattened {
    let mut flat = Flattened::default();

    for user in users {
        if user.is_flagged {
            continue;
        }
        let author = user.id.map(UserId::into_string).or(user.name);

        for feed in user.feeds.unwrap_or_default() {
            let (raw_url, title) = match feed {
                DirectoryFeed::Url(url) => (url, None),
                DirectoryFeed::Entry { url, title } => (url, title),
            };
            match normalize_source_url(&raw_url, allow_private) {
                Ok(url) => flat.sources.push(DiscoveredSource {
                    url,
                    title,
                    author: author.clone(),
                }),
                Err(e) => {
                    flat.dropped += 1;
                    tracing::debug!(url = %raw_url, author = ?author, error = %e, "Skipping unusable source URL");
                }
            }
        }
    }

    flat
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the user directory service.
pub struct DirectoryClient {
    client: reqwest::Client,
    url: String,
    tokens: Arc<dyn TokenIssuer>,
    timeout: Duration,
    allow_private: bool,
}

impl DirectoryClient {
    pub fn new(client: reqwest::Client, url: impl Into<String>, tokens: Arc<dyn TokenIssuer>) -> Self {
        Self {
            client,
            url: url.into(),
            tokens,
            timeout: Duration::from_secs(30),
            allow_private: false,
        }
    }

    /// Overall deadline for token issuance, request and body read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Accept feed URLs pointing at loopback or private addresses.
    pub fn allow_private_urls(mut self, allow: bool) -> Self {
        self.allow_private = allow;
        self
    }

    async fn fetch_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        // Minted per request and dropped on return.
        let token = self.tokens.issue().await?;
        let mut auth = HeaderValue::from_str(&format!("bearer {}", token.expose_secret()))
            .map_err(|_| DirectoryError::InvalidToken)?;
        auth.set_sensitive(true);

        let response = self
            .client
            .get(&self.url)
            .header(AUTHORIZATION, auth)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(DirectoryError::Unavailable {
                status: response.status().as_u16(),
            });
        }

        let bytes = read_limited_bytes(response, MAX_DIRECTORY_RESPONSE).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl SourceDirectory for DirectoryClient {
    async fn fetch_sources(&self) -> Result<Vec<DiscoveredSource>, DirectoryError> {
        let users = tokio::time::timeout(self.timeout, self.fetch_users())
            .await
            .map_err(|_| DirectoryError::Timeout)??;

        let user_count = users.len();
        let flagged = users.iter().filter(|u| u.is_flagged).count();
        let Flattened { sources, dropped } = flatten_users(users, self.allow_private);

        if dropped > 0 {
            tracing::info!(
                dropped = dropped,
                allow_private = self.allow_private,
                "Dropped unusable or private source URLs"
            );
        }
        tracing::debug!(
            users = user_count,
            flagged = flagged,
            sources = sources.len(),
            "Fetched directory sources"
        );
        Ok(sources)
    }
}

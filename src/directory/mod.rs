//! Source discovery from the user directory service.
//!
//! - [`client`] - authenticated `GET` of the user list and flattening of
//!   per-user feed lists into [`DiscoveredSource`]s
//! - [`token`] - short-lived service-to-service bearer tokens

mod client;
pub mod token;

use async_trait::async_trait;
use thiserror::Error;

pub use client::DirectoryClient;
pub use token::{HttpTokenIssuer, SignedTokenIssuer, TokenError, TokenIssuer};

use crate::util::BodyError;

/// A feed URL reported by the directory, before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSource {
    /// Normalized URL, the dedup key
    pub url: String,
    pub title: Option<String>,
    /// Owning directory user
    pub author: Option<String>,
}

/// Errors fetching sources. The cycle treats every variant as the directory
/// being unavailable for the current pass.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory returned status {status}")]
    Unavailable { status: u16 },
    #[error("Directory request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Directory request timed out")]
    Timeout,
    #[error("Directory response unreadable: {0}")]
    Body(#[from] BodyError),
    #[error("Directory response malformed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Could not obtain service token: {0}")]
    Token(#[from] TokenError),
    #[error("Service token is not a valid header value")]
    InvalidToken,
}

/// Where the cycle gets its sources from.
#[async_trait]
pub trait SourceDirectory: Send + Sync {
    /// Fetch every source owned by an unflagged user. No internal retry.
    async fn fetch_sources(&self) -> Result<Vec<DiscoveredSource>, DirectoryError>;
}

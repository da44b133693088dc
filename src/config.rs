//! Configuration file parser for `feedcycle.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde but logged as warnings, since they are
//! usually typos. `FEEDCYCLE_*` environment variables override the file.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::directory::{HttpTokenIssuer, SignedTokenIssuer, TokenIssuer};
use crate::pipeline::CycleConfig;
use crate::worker::WorkerConfig;

pub const ENV_DIRECTORY_URL: &str = "FEEDCYCLE_DIRECTORY_URL";
pub const ENV_DATABASE: &str = "FEEDCYCLE_DATABASE";
pub const ENV_TOKEN_SECRET: &str = "FEEDCYCLE_TOKEN_SECRET";
pub const ENV_TOKEN_ISSUER_URL: &str = "FEEDCYCLE_TOKEN_ISSUER_URL";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Missing required setting `{0}`")]
    Missing(&'static str),

    #[error("Invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory service endpoint listing users and their feeds. Required.
    pub directory_url: Option<String>,

    /// SQLite database holding feeds and jobs. `:memory:` for a throwaway run.
    pub database_path: String,

    /// Timeout for every outbound request, in seconds.
    pub request_timeout_secs: u64,

    /// Accept feed URLs on loopback/private hosts.
    pub allow_private_urls: bool,

    pub token: TokenConfig,
    pub cycle: CycleSection,
    pub worker: WorkerSection,
}

/// Service-to-service credentials for the directory.
///
/// `issuer_url` wins over `secret` when both are set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub service: String,
    /// Shared signing secret. Redacted from `Debug`.
    #[serde(deserialize_with = "deserialize_secret")]
    pub secret: Option<SecretString>,
    pub issuer_url: Option<String>,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CycleSection {
    pub enqueue_concurrency: usize,
    /// Retry delay after a pass that enqueued nothing; 0 (default) disables it.
    pub stall_retry_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub enabled: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory_url: None,
            database_path: "feedcycle.db".to_string(),
            request_timeout_secs: 30,
            allow_private_urls: false,
            token: TokenConfig::default(),
            cycle: CycleSection::default(),
            worker: WorkerSection::default(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            service: "feedcycle".to_string(),
            secret: None,
            issuer_url: None,
            ttl_secs: 60,
        }
    }
}

impl Default for CycleSection {
    fn default() -> Self {
        Self {
            enqueue_concurrency: 16,
            stall_retry_secs: 0,
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 8,
            poll_interval_ms: 1000,
        }
    }
}

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("directory_url", &[]),
    ("database_path", &[]),
    ("request_timeout_secs", &[]),
    ("allow_private_urls", &[]),
    ("token", &["service", "secret", "issuer_url", "ttl_secs"]),
    ("cycle", &["enqueue_concurrency", "stall_retry_secs"]),
    ("worker", &["enabled", "concurrency", "poll_interval_ms"]),
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `FEEDCYCLE_*` overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_DIRECTORY_URL) {
            self.directory_url = Some(url);
        }
        if let Some(path) = get(ENV_DATABASE) {
            self.database_path = path;
        }
        if let Some(secret) = get(ENV_TOKEN_SECRET) {
            self.token.secret = Some(SecretString::from(secret));
        }
        if let Some(url) = get(ENV_TOKEN_ISSUER_URL) {
            self.token.issuer_url = Some(url);
        }
        self
    }

    /// Check everything the pipeline needs before it starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let directory_url = self
            .directory_url
            .as_deref()
            .ok_or(ConfigError::Missing("directory_url"))?;
        check_http_url("directory_url", directory_url)?;

        if let Some(issuer_url) = &self.token.issuer_url {
            check_http_url("token.issuer_url", issuer_url)?;
        } else if self.token.secret.is_none() {
            return Err(ConfigError::Missing("token.secret or token.issuer_url"));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.token.ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "token.ttl_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            enqueue_concurrency: self.cycle.enqueue_concurrency.max(1),
            stall_retry: (self.cycle.stall_retry_secs > 0)
                .then(|| Duration::from_secs(self.cycle.stall_retry_secs)),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker.concurrency.max(1),
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms.max(1)),
            request_timeout: self.request_timeout(),
        }
    }

    /// Build the token issuer: remote when `token.issuer_url` is set,
    /// otherwise locally signed with `token.secret`.
    pub fn token_issuer(&self, client: reqwest::Client) -> Result<Arc<dyn TokenIssuer>, ConfigError> {
        if let Some(url) = &self.token.issuer_url {
            return Ok(Arc::new(HttpTokenIssuer::new(
                client,
                url.clone(),
                self.token.service.clone(),
            )));
        }
        let secret = self
            .token
            .secret
            .clone()
            .ok_or(ConfigError::Missing("token.secret or token.issuer_url"))?;
        let issuer = SignedTokenIssuer::new(
            self.token.service.clone(),
            secret,
            Duration::from_secs(self.token.ttl_secs),
        )
        .map_err(|e| ConfigError::Invalid {
            key: "token.service",
            reason: e.to_string(),
        })?;
        Ok(Arc::new(issuer))
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        match KNOWN_KEYS.iter().find(|(known, _)| *known == key.as_str()) {
            None => tracing::warn!(key = %key, "Unknown key in config file, ignoring"),
            Some((section, children)) if !children.is_empty() => {
                if let Some(table) = value.as_table() {
                    for child in table.keys() {
                        if !children.contains(&child.as_str()) {
                            tracing::warn!(key = %format!("{section}.{child}"), "Unknown key in config file, ignoring");
                        }
                    }
                }
            }
            Some(_) => {}
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

fn check_http_url(key: &'static str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

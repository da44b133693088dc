use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Reasons a directory-supplied feed URL is not usable as a dedup key.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SourceUrlError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("Private or loopback address not allowed: {0}")]
    PrivateHost(String),
}

/// Normalizes a feed URL reported by the directory into the form stored as
/// the feed's unique key.
///
/// Surrounding whitespace and the fragment are dropped and the URL is
/// re-serialized by [`Url`], so `HTTPS://Example.com` and
/// `https://example.com/` map to the same key. Only http(s) URLs with a host
/// are accepted. Unless `allow_private` is set, `localhost` and loopback,
/// private, link-local or unspecified IP literals are rejected so a user
/// cannot point workers at internal services.
///
/// # Examples
///
/// ```
/// use feedcycle::util::normalize_source_url;
///
/// let url = normalize_source_url("  HTTPS://Example.com/feed#top ", false).unwrap();
/// assert_eq!(url, "https://example.com/feed");
///
/// assert!(normalize_source_url("http://127.0.0.1/feed", false).is_err());
/// assert!(normalize_source_url("http://127.0.0.1/feed", true).is_ok());
/// ```
pub fn normalize_source_url(raw: &str, allow_private: bool) -> Result<String, SourceUrlError> {
    let mut url = Url::parse(raw.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(SourceUrlError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(SourceUrlError::MissingHost)?;
    if !allow_private {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(SourceUrlError::PrivateHost(host.to_owned()));
        }
        // IPv6 hosts come back bracketed
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            if is_internal_ip(&ip) {
                return Err(SourceUrlError::PrivateHost(ip.to_string()));
            }
        }
    }

    url.set_fragment(None);
    Ok(url.to_string())
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link-local
        }
    }
}

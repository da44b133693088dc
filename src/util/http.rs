use futures::StreamExt;
use thiserror::Error;

/// Failure while reading a size-capped response body.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Response too large (exceeds {0} bytes)")]
    TooLarge(usize),
    /// Fewer bytes arrived than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: usize },
}

/// Read a response body, refusing to buffer more than `limit` bytes.
pub async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, BodyError> {
    let expected_length = response.content_length();

    // Fast path: Content-Length already over the cap
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(BodyError::TooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(BodyError::TooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(BodyError::Incomplete {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

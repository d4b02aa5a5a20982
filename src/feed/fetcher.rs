use crate::feed::parser::{parse_document, FormatError, RawDocument};
use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

/// Default cap on a feed body (10MB)
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

/// Errors that can occur while retrieving a feed over HTTP.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, body read, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request and body read together exceeded the configured deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the size limit
    #[error("Response too large (limit {0} bytes)")]
    ResponseTooLarge(usize),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Why a single feed produced no document.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Per-request limits applied by [`fetch_document`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Deadline for the whole retrieval; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Maximum accepted body size in bytes
    pub max_bytes: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            max_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

/// Redirect hops followed before a request fails
const MAX_REDIRECTS: usize = 10;

/// Build the HTTP client shared by every fetch of a run.
///
/// Request deadlines are applied per call by [`fetch_document`], not here.
pub fn build_client(user_agent: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .redirect(redirect_policy())
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent);
    }
    builder.build()
}

/// Follow up to [`MAX_REDIRECTS`] hops, failing on loops
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(to = %url, hop = attempt.previous().len() + 1, "Following redirect");
        attempt.follow()
    })
}

/// Retrieve one feed and decode it as an RSS 2.0 document.
///
/// Issues a single GET (no retries), reads the whole body and hands it to
/// [`parse_document`]. Performs no store access.
///
/// # Errors
///
/// - [`FeedError::Fetch`] for network failures, non-2xx statuses, deadline
///   expiry, oversized or truncated bodies
/// - [`FeedError::Format`] when the body is not a valid RSS 2.0 document
pub async fn fetch_document(
    client: &reqwest::Client,
    url: &str,
    options: &FetchOptions,
) -> Result<RawDocument, FeedError> {
    let bytes = match options.timeout {
        Some(limit) => tokio::time::timeout(limit, retrieve(client, url, options.max_bytes))
            .await
            .map_err(|_| FetchError::Timeout(limit))??,
        None => retrieve(client, url, options.max_bytes).await?,
    };

    let document = parse_document(&bytes)?;
    tracing::debug!(
        url = %url,
        bytes = bytes.len(),
        items = document.items.len(),
        "Feed document decoded"
    );
    Ok(document)
}

async fn retrieve(
    client: &reqwest::Client,
    url: &str,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, limit).await
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

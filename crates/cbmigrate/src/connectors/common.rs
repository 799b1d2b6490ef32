//! Common utilities shared across connectors.
//!
//! HTTP client creation, URL validation and mapping of HTTP error responses
//! onto [`Error`] variants.

use crate::error::{Error, Result};
use reqwest::Client;
use std::time::Duration;

/// Default HTTP timeout for all connectors.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum size of a local catalog file (10MB).
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Creates a configured HTTP client with timeout.
///
/// `accept_invalid_certs` disables certificate verification for
/// self-signed cluster certificates.
#[must_use]
pub fn create_http_client(accept_invalid_certs: bool) -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Validates that a URL uses an HTTP scheme.
pub fn validate_url(url: &str) -> Result<()> {
    let has_valid_scheme = ["http://", "https://"].iter().any(|s| url.starts_with(s));

    if !has_valid_scheme {
        return Err(Error::Config(format!(
            "Invalid URL scheme in '{}'. Allowed: http, https",
            url
        )));
    }

    if url.len() < 10 {
        return Err(Error::Config(format!("Invalid URL format: {}", url)));
    }

    Ok(())
}

/// Joins a base URL and a path without doubling the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Handles HTTP error responses from a source.
pub fn handle_http_error(status_code: u16, body: &str, source_name: &str) -> Error {
    match status_code {
        429 => Error::RateLimit(60), // Default 60s retry
        401 | 403 => Error::Authentication(format!("{} auth failed: {}", source_name, body)),
        _ => Error::SourceConnection(format!("{} error {}: {}", source_name, status_code, body)),
    }
}

/// Handles HTTP error responses from the destination.
pub fn handle_destination_error(status_code: u16, body: &str) -> Error {
    match status_code {
        429 => Error::RateLimit(60),
        401 | 403 => Error::Authentication(format!("Couchbase auth failed: {}", body)),
        _ => Error::DestinationConnection(format!("Couchbase error {}: {}", status_code, body)),
    }
}

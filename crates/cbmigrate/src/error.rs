//! Error types for cbmigrate.
//!
//! Pipeline-fatal failures are reported through [`Error`]. Problems that only
//! affect one index are reported through [`crate::index::CompileError`] and
//! never abort a run.

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a migration.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The source could not be reached or rejected a request.
    #[error("source connection error: {0}")]
    SourceConnection(String),

    /// The destination could not be reached or provisioned.
    #[error("destination connection error: {0}")]
    DestinationConnection(String),

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The remote service asked us to slow down; value is the suggested wait in seconds.
    #[error("rate limited, retry after {0}s")]
    RateLimit(u64),

    /// A document or catalog record could not be read from the source.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// A batch write to the destination failed.
    #[error("write error: {0}")]
    Write(String),

    /// The document key expression could not be parsed or rendered.
    #[error("document key error: {0}")]
    KeyGeneration(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Several independent failures, e.g. from both halves of the stream.
    #[error("{}", join_messages(.0))]
    Multiple(Vec<Error>),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// Joins independent errors into one.
    ///
    /// Returns `None` for an empty list and the error itself for a single
    /// entry. Nested `Multiple` errors are flattened.
    #[must_use]
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Multiple(flat)),
        }
    }

    /// Returns every leaf error contained in this one.
    #[must_use]
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Multiple(inner) => inner.iter().flat_map(Error::errors).collect(),
            other => vec![other],
        }
    }
}

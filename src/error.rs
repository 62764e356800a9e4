use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while refreshing or serving feature definitions.
///
/// Configuration errors ([`Error::MissingApiHost`], [`Error::MissingSecretApiKey`],
/// [`Error::InvalidApiHost`]) indicate a caller bug and are returned to the caller. All other
/// variants are transient and get absorbed by the refresh pipeline.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The context does not specify an upstream host.
    #[error("missing required context for fetching features: api_host")]
    MissingApiHost,

    /// Server-side evaluation was requested but the context has no secret API key.
    #[error("missing required context for fetching features: secret_api_key")]
    MissingSecretApiKey,

    /// Upstream URL could not be built from the configured host.
    #[error("invalid api_host configuration")]
    InvalidApiHost(#[source] url::ParseError),

    /// Transport error while talking to the upstream API.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// Upstream responded with a non-success status code.
    #[error("received non-200 response from upstream: {0}")]
    UpstreamStatus(StatusCode),

    /// Upstream response body is not valid JSON.
    #[error("unable to parse response")]
    InvalidResponse(#[source] Arc<serde_json::Error>),

    /// Upstream response body is valid JSON, but carries no payload object.
    #[error("upstream returned an empty payload")]
    EmptyResponse,

    /// Cache backend failure.
    #[error("cache backend error: {0}")]
    Cache(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Returns `true` for errors that are caused by misconfiguration and will not go away on retry.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::MissingApiHost | Error::MissingSecretApiKey | Error::InvalidApiHost(_)
        )
    }

    /// Wrap an arbitrary cache backend error.
    pub fn cache(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Cache(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidResponse(Arc::new(value))
    }
}

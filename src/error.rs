use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while fetching experiments, tracking events,
/// or serving analytics ingress.
///
/// Most public operations never surface these errors: the experiment system is an enhancement
/// layer, so fetch and tracking failures degrade silently and are only logged. The errors are
/// returned from lower-level building blocks ([`ExperimentSource`](crate::ExperimentSource),
/// [`Storage`](crate::Storage), [`EventStore`](crate::ingress::EventStore)) and from operations
/// that must confirm success, like [`Tracker::clear_all`](crate::Tracker::clear_all).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The experiments endpoint replied with a non-2xx status.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(StatusCode),

    /// The experiments endpoint replied with a body we could not use.
    #[error("malformed experiments response: {0}")]
    MalformedResponse(String),

    /// Network error, including timeouts.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Reading or writing persisted state failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A (de)serialization error.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

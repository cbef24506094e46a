//! Client error taxonomy.
//!
//! The split between request-side and response-side failures matters: they
//! are recovered with independent retry budgets. Protocol-invariant
//! violations and fatal errors are never retried.

use seqbus_core::CoreError;
use thiserror::Error;

/// Errors surfaced by the pull/dispatch protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// The request could not be sent at all (connect failure, DNS, request
    /// build). Counted against the request-phase retry budget.
    #[error("Request error: {message}")]
    Request {
        /// What failed
        message: String,
        /// Transport-level cause, when one exists
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The request was sent but the response failed: timeout, remote
    /// disconnect, malformed payload, or protocol-version mismatch.
    /// Counted against the response-phase retry budget.
    #[error("Response error: {message}")]
    Response {
        /// What failed
        message: String,
        /// Remote exception class from the error header, when present
        class: Option<String>,
        /// Transport-level cause, when one exists
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A consumer callback returned ERROR. Recovered by the dispatcher up
    /// to its own budget, independent of network retries.
    #[error("Processing error: {0}")]
    Processing(String),

    /// A correctness guarantee was broken: SCN regression without an
    /// intervening rollback, conflicting partial windows, or an illegal
    /// state transition. Never tolerated; halts the affected connection.
    #[error("Protocol invariant violated: {0}")]
    ProtocolInvariant(String),

    /// Required upstream metadata is missing. Aborts startup, never
    /// retried.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Client-side configuration error, raised immediately at registration
    /// time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Core data-model error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// I/O error (checkpoint store)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (schemas, checkpoint persistence)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Request-phase error without a transport cause.
    pub fn request(message: impl Into<String>) -> Self {
        Error::Request {
            message: message.into(),
            source: None,
        }
    }

    /// Response-phase error without a transport cause.
    pub fn response(message: impl Into<String>) -> Self {
        Error::Response {
            message: message.into(),
            class: None,
            source: None,
        }
    }

    /// Response-phase error carrying the remote exception class.
    pub fn response_class(message: impl Into<String>, class: impl Into<String>) -> Self {
        Error::Response {
            message: message.into(),
            class: Some(class.into()),
            source: None,
        }
    }

    /// True for send-side failures.
    pub fn is_request(&self) -> bool {
        matches!(self, Error::Request { .. })
    }

    /// True for response-side failures.
    pub fn is_response(&self) -> bool {
        matches!(self, Error::Response { .. })
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

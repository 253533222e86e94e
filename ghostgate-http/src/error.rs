//! Wire error body and client-side error types.

use serde::{Deserialize, Serialize};

/// JSON body of every non-2xx response.
///
/// `balance` and `required` are present only on `402` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Stable machine-readable code such as `INSUFFICIENT_CREDITS`.
    pub code: String,
    /// Balance at the time of a `402`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<u64>,
    /// Cost that the balance did not cover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<u64>,
}

impl ErrorBody {
    /// A body without balance details.
    #[must_use]
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            balance: None,
            required: None,
        }
    }
}

/// Errors of the HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The request never produced a response.
    #[cfg(feature = "client")]
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The base URL could not be parsed or joined.
    #[cfg(feature = "client")]
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A header value could not be encoded.
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),

    /// The signer refused to sign the access payload.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The gateway answered with an error status.
    #[error("gateway rejected the request with {status} {}: {}", body.code, body.error)]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Decoded error body.
        body: ErrorBody,
    },
}

impl HttpError {
    /// `true` if the gateway answered `402 Payment Required`.
    #[must_use]
    pub const fn is_payment_required(&self) -> bool {
        matches!(self, Self::Rejected { status: 402, .. })
    }
}

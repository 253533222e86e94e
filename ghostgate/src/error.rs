//! Authorization failures of the gate.
//!
//! Every [`GateError`] carries a stable machine code and an HTTP status so the
//! transport layer can map it without inspecting messages.

use crate::access::{InvalidSignature, PayloadError, Staleness};
use crate::pricing::InvalidCostHeader;
use crate::store::StoreError;

/// Terminal errors of the gate state machine.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// A required header is absent or empty.
    #[error("missing required header {0}")]
    MissingHeaders(&'static str),
    /// The payload header is not a well-formed access payload.
    #[error(transparent)]
    MalformedPayload(#[from] PayloadError),
    /// The request id header is too long or not printable.
    #[error("invalid request id: {0}")]
    InvalidRequestId(String),
    /// The client cost header was honored but unusable.
    #[error(transparent)]
    InvalidCost(#[from] InvalidCostHeader),
    /// The signed service does not match the requested path.
    #[error("signed service {signed:?} does not match requested service {requested:?}")]
    ServiceMismatch {
        /// Service slug from the request path.
        requested: String,
        /// Service slug inside the signed payload.
        signed: String,
    },
    /// The signature does not verify.
    #[error(transparent)]
    InvalidSignature(#[from] InvalidSignature),
    /// The payload is outside the replay window.
    #[error("signature expired: {0}")]
    SignatureExpired(#[from] Staleness),
    /// The balance does not cover the resolved cost.
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits {
        /// Balance at the time of the attempt.
        balance: u64,
        /// Resolved cost.
        required: u64,
    },
    /// The nonce was already used.
    #[error("replay detected for nonce {nonce}")]
    ReplayDetected {
        /// The reused nonce.
        nonce: String,
    },
    /// Storage failed; nothing was charged.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::MissingHeaders(_)
            | Self::MalformedPayload(_)
            | Self::InvalidRequestId(_)
            | Self::InvalidCost(_) => 400,
            Self::ServiceMismatch { .. } | Self::InvalidSignature(_) | Self::SignatureExpired(_) => {
                401
            }
            Self::InsufficientCredits { .. } => 402,
            Self::ReplayDetected { .. } => 409,
            Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingHeaders(_) => "MISSING_HEADERS",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::InvalidRequestId(_) => "INVALID_REQUEST_ID",
            Self::InvalidCost(_) => "INVALID_CREDIT_COST",
            Self::ServiceMismatch { .. } => "SERVICE_MISMATCH",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::SignatureExpired(_) => "SIGNATURE_EXPIRED",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::ReplayDetected { .. } => "REPLAY_DETECTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            StoreError::ReplayDetected { nonce, .. } => Self::ReplayDetected { nonce },
            other => Self::Internal(other.to_string()),
        }
    }
}

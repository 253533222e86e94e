//! Mapping of domain failures onto HTTP responses.
//!
//! Every error becomes a JSON [`ErrorBody`] with the status of the failing
//! operation; nothing else in the router builds error responses.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::response::{IntoResponse, Response};
use ghostgate::GateError;
use ghostgate::store::StoreError;
use ghostgate::sync::SyncError;
use ghostgate::wallet::InvalidWallet;
use http::StatusCode;

use crate::error::ErrorBody;

/// Failure of a route handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The gate refused the request.
    #[error(transparent)]
    Gate(#[from] GateError),
    /// A sync pass failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// A path or body wallet is not an address.
    #[error(transparent)]
    InvalidWallet(#[from] InvalidWallet),
    /// The request body is not the expected JSON.
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    /// No deposit source is configured.
    #[error("deposit sync is not configured")]
    SyncDisabled,
    /// Storage failed outside the gate.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody(rejection.body_text())
    }
}

impl ApiError {
    /// HTTP status of this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        let code = match self {
            Self::Gate(err) => err.status(),
            Self::Sync(err) => err.status(),
            Self::InvalidWallet(_) | Self::InvalidBody(_) => 400,
            Self::SyncDisabled => 503,
            Self::Store(_) => 500,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Gate(err) => err.code(),
            Self::Sync(err) => err.code(),
            Self::InvalidWallet(_) => "INVALID_WALLET",
            Self::InvalidBody(_) => "INVALID_BODY",
            Self::SyncDisabled => "SYNC_DISABLED",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }

    fn body(&self) -> ErrorBody {
        let mut body = ErrorBody::new(self.to_string(), self.code());
        if let Self::Gate(GateError::InsufficientCredits { balance, required }) = self {
            body.balance = Some(*balance);
            body.required = Some(*required);
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        #[cfg(feature = "telemetry")]
        if status.is_server_error() {
            tracing::error!(code = self.code(), "request failed: {self}");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credits_carries_balance() {
        let err = ApiError::from(GateError::InsufficientCredits {
            balance: 3,
            required: 5,
        });
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
        let body = err.body();
        assert_eq!(body.code, "INSUFFICIENT_CREDITS");
        assert_eq!((body.balance, body.required), (Some(3), Some(5)));
    }

    #[test]
    fn test_other_errors_omit_balance() {
        let err = ApiError::from(GateError::ReplayDetected { nonce: "n".into() });
        assert_eq!(err.status(), StatusCode::CONFLICT);
        let json = serde_json::to_value(err.body()).unwrap();
        assert!(json.get("balance").is_none());
        assert_eq!(json["code"], "REPLAY_DETECTED");
    }

    #[test]
    fn test_sync_conflict_is_409() {
        let err = ApiError::from(SyncError::Conflict {
            expected: Some(1),
            actual: Some(2),
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "SYNC_CONFLICT");
        assert_eq!(ApiError::SyncDisabled.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

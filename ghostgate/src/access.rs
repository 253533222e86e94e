//! Signed access payloads and the verification seam.
//!
//! A caller signs `{service, timestamp, nonce}` and sends the JSON alongside
//! the signature. The JSON is parsed strictly; its fields are then handed to a
//! [`SignatureVerifier`], which rebuilds the signed structure and recovers the
//! signer. The JSON is never trusted beyond that.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::timestamp::UnixTimestamp;

/// Default maximum age of a signed payload.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(60);

/// The message a caller signs to access a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessPayload {
    /// Service slug the signature authorizes.
    pub service: String,
    /// Signing time in seconds.
    pub timestamp: UnixTimestamp,
    /// Single-use nonce.
    pub nonce: String,
}

/// Reasons a payload header is rejected before signature verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The header is not a JSON object with the expected fields.
    #[error("payload is not valid access JSON: {0}")]
    Json(String),
    /// A required string field is empty.
    #[error("payload field {0} must not be empty")]
    EmptyField(&'static str),
}

impl AccessPayload {
    /// Parses the payload header.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] for malformed JSON, missing fields, unknown
    /// fields, or empty `service`/`nonce`.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let payload: Self =
            serde_json::from_str(raw).map_err(|e| PayloadError::Json(e.to_string()))?;
        if normalize_service(&payload.service).is_empty() {
            return Err(PayloadError::EmptyField("service"));
        }
        if payload.nonce.trim().is_empty() {
            return Err(PayloadError::EmptyField("nonce"));
        }
        Ok(payload)
    }

    /// The payload's service slug in normalized form.
    #[must_use]
    pub fn normalized_service(&self) -> &str {
        normalize_service(&self.service)
    }
}

/// Normalizes a service slug: surrounding whitespace and slashes are dropped.
///
/// Slugs may contain inner separators (`"weather/forecast"`).
#[must_use]
pub fn normalize_service(slug: &str) -> &str {
    slug.trim().trim_matches('/')
}

/// Why a payload timestamp failed the freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Staleness {
    /// Timestamp is later than the server clock.
    #[error("payload timestamp {timestamp} is ahead of server time {now}")]
    FromFuture {
        /// Declared timestamp.
        timestamp: UnixTimestamp,
        /// Server time.
        now: UnixTimestamp,
    },
    /// Timestamp is older than the replay window.
    #[error("payload is {age}s old, replay window is {window}s")]
    Expired {
        /// Age of the payload in seconds.
        age: u64,
        /// Replay window in seconds.
        window: u64,
    },
}

/// Rejects payloads outside `[now - window, now]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessGuard {
    window: Duration,
}

impl Default for FreshnessGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}

impl FreshnessGuard {
    /// Creates a guard with the given replay window.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }

    /// The configured replay window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Checks `timestamp` against `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Staleness`] when the timestamp is in the future or older than
    /// the window.
    pub fn check(&self, timestamp: UnixTimestamp, now: UnixTimestamp) -> Result<(), Staleness> {
        let age = timestamp
            .seconds_until(now)
            .ok_or(Staleness::FromFuture { timestamp, now })?;
        let window = self.window.as_secs();
        if age > window {
            return Err(Staleness::Expired { age, window });
        }
        Ok(())
    }
}

/// Verification failed; the signature does not prove any signer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid signature: {0}")]
pub struct InvalidSignature(pub String);

/// Recovers the signer of an access payload.
///
/// Implementations must rebuild the signed structure from `payload` rather
/// than trusting any caller-provided encoding.
pub trait SignatureVerifier: Send + Sync {
    /// Returns the address that signed `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSignature`] if the signature cannot be decoded or
    /// does not recover to an address.
    fn recover_signer(
        &self,
        payload: &AccessPayload,
        signature: &str,
    ) -> Result<Address, InvalidSignature>;
}

/// Boxed future returned by [`AccessSigner::sign_access`].
pub type SignFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, Box<dyn std::error::Error + Send + Sync>>> + Send + 'a>>;

/// Client-side counterpart of [`SignatureVerifier`].
pub trait AccessSigner: Send + Sync {
    /// The signer's address.
    fn address(&self) -> Address;

    /// Signs `payload`, returning the `0x`-prefixed hex signature.
    fn sign_access<'a>(&'a self, payload: &'a AccessPayload) -> SignFuture<'a>;
}

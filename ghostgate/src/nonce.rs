//! Replay protection records.
//!
//! A nonce claim is the `(signer, service, nonce)` tuple of an accepted access
//! payload. How strictly claims are deduplicated is a [`NonceGuard`] chosen
//! when the store is built.

use serde::{Deserialize, Serialize};

use crate::timestamp::UnixTimestamp;
use crate::wallet::WalletKey;

/// An access payload nonce to be recorded at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceClaim {
    /// Recovered signer.
    pub signer: WalletKey,
    /// Service slug the payload authorizes.
    pub service: String,
    /// Single-use nonce from the payload.
    pub nonce: String,
    /// Timestamp declared in the payload.
    pub payload_timestamp: UnixTimestamp,
    /// Hex signature over the payload.
    pub signature: String,
}

/// Deduplication strategy for nonce claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonceGuard {
    /// Claims are not recorded; every request is accepted.
    Disabled,
    /// Claims are checked and recorded by the application. Two racing
    /// requests may both pass.
    BestEffort,
    /// A storage-layer uniqueness constraint rejects duplicates.
    #[default]
    Enforced,
}

impl NonceGuard {
    /// Whether claims are persisted at all.
    #[must_use]
    pub const fn records(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

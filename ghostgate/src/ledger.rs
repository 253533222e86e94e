//! Balance rows, audit entries and the request/receipt types of ledger mutations.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::nonce::NonceClaim;
use crate::timestamp::UnixTimestamp;
use crate::wallet::WalletKey;

/// Spendable credits held by one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    /// Canonical wallet key.
    pub wallet: WalletKey,
    /// Current spendable credits.
    pub credits: u64,
    /// Last block whose deposits have been folded into `credits`.
    /// `None` until the first sync.
    pub last_synced_block: Option<u64>,
    /// Deposited wei not yet worth a whole credit.
    pub residual_wei: U256,
    /// Time of the last mutation.
    pub updated_at: UnixTimestamp,
}

impl CreditBalance {
    /// An empty balance row for a wallet that has never been seen.
    #[must_use]
    pub fn empty(wallet: WalletKey, now: UnixTimestamp) -> Self {
        Self {
            wallet,
            credits: 0,
            last_synced_block: None,
            residual_wei: U256::ZERO,
            updated_at: now,
        }
    }
}

/// Whether balance mutations append audit entries.
///
/// Chosen once when a store is built; the gate and synchronizer never branch
/// on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSink {
    /// Mutations are not journaled.
    Disabled,
    /// Every mutation appends a [`LedgerEntry`] inside its own transaction.
    #[default]
    Persistent,
}

impl LedgerSink {
    /// Returns `entry` if this sink journals mutations.
    #[must_use]
    pub fn admit(self, entry: LedgerEntry) -> Option<LedgerEntry> {
        match self {
            Self::Disabled => None,
            Self::Persistent => Some(entry),
        }
    }
}

/// Direction of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerDirection {
    /// Credits added (deposit sync, manual grant).
    Credit,
    /// Credits spent by an authorized request.
    Debit,
    /// Administrative override; the amount is a signed delta.
    Adjustment,
}

impl LedgerDirection {
    /// Stable storage label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "CREDIT",
            Self::Debit => "DEBIT",
            Self::Adjustment => "ADJUSTMENT",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "CREDIT" => Some(Self::Credit),
            "DEBIT" => Some(Self::Debit),
            "ADJUSTMENT" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

/// Immutable audit record of one balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Wallet whose balance changed.
    pub wallet: WalletKey,
    /// Kind of change.
    pub direction: LedgerDirection,
    /// Size of the change. Positive for credits and debits; for adjustments
    /// the signed delta `balance_after - balance_before`.
    pub amount: i64,
    /// Balance before the mutation.
    pub balance_before: u64,
    /// Balance after the mutation.
    pub balance_after: u64,
    /// Free-form reason (e.g. `"gate:weather"`, `"deposit-sync"`).
    pub reason: String,
    /// Service slug for debits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Nonce of the authorizing payload for debits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Caller supplied request id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Extra structured context.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Time the entry was written.
    pub created_at: UnixTimestamp,
}

impl LedgerEntry {
    /// The signed contribution of this entry to the wallet's balance.
    #[must_use]
    pub const fn signed_amount(&self) -> i64 {
        match self.direction {
            LedgerDirection::Credit | LedgerDirection::Adjustment => self.amount,
            LedgerDirection::Debit => -self.amount,
        }
    }
}

/// Context attached to a debit.
#[derive(Debug, Clone, Default)]
pub struct DebitContext {
    /// Reason recorded in the ledger.
    pub reason: String,
    /// Service being paid for.
    pub service: Option<String>,
    /// Nonce claim to record in the same atomic unit as the debit.
    pub nonce: Option<NonceClaim>,
    /// Caller supplied request id.
    pub request_id: Option<String>,
    /// Extra structured context for the ledger entry.
    pub metadata: serde_json::Value,
}

/// Result of a successful debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebitReceipt {
    /// Balance before the debit.
    pub before: u64,
    /// Balance after the debit.
    pub after: u64,
    /// Whether a nonce row was written as part of the debit.
    pub nonce_accepted: bool,
}

/// Result of a credit or balance override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    /// Balance before the mutation.
    pub before: u64,
    /// Balance after the mutation.
    pub after: u64,
}

/// A synchronized scan to fold into a wallet's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCommit {
    /// Wallet being synchronized.
    pub wallet: WalletKey,
    /// Cursor value observed before the scan started; the commit only applies
    /// if the stored cursor still equals it.
    pub expected_cursor: Option<u64>,
    /// Last block covered by the scan.
    pub scanned_to_block: u64,
    /// Whole credits to add.
    pub added_credits: u64,
    /// Residual wei to store after the conversion.
    pub residual_wei: U256,
    /// Number of deposit events folded in, for the ledger metadata.
    pub matched_deposits: u64,
    /// Gross wei observed by the scan, for the ledger metadata.
    pub deposited_wei: U256,
}

/// Outcome of [`SyncCommit`] application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncApplied {
    /// Balance after applying the commit.
    pub balance: CreditBalance,
    /// Credits actually added.
    pub added_credits: u64,
}

/// A replayed request observed by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayAttempt {
    /// Recovered signer of the replayed payload.
    pub signer: WalletKey,
    /// Service slug of the replayed payload.
    pub service: String,
    /// Replayed nonce.
    pub nonce: String,
    /// When the replay was rejected.
    pub observed_at: UnixTimestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_labels_roundtrip() {
        for d in [
            LedgerDirection::Credit,
            LedgerDirection::Debit,
            LedgerDirection::Adjustment,
        ] {
            assert_eq!(LedgerDirection::parse(d.as_str()), Some(d));
        }
        assert_eq!(LedgerDirection::parse("REFUND"), None);
    }

    #[test]
    fn test_signed_amount() {
        let wallet: WalletKey = "0x0000000000000000000000000000000000000001".parse().unwrap();
        let mut entry = LedgerEntry {
            wallet,
            direction: LedgerDirection::Debit,
            amount: 3,
            balance_before: 10,
            balance_after: 7,
            reason: "gate:weather".into(),
            service: None,
            nonce: None,
            request_id: None,
            metadata: serde_json::Value::Null,
            created_at: UnixTimestamp::from_secs(1),
        };
        assert_eq!(entry.signed_amount(), -3);
        entry.direction = LedgerDirection::Adjustment;
        entry.amount = -4;
        assert_eq!(entry.signed_amount(), -4);
    }
}

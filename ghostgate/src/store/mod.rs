//! The credit store seam.
//!
//! [`CreditStore`] is the only way balances, nonces, ledger entries and
//! pricing are read or mutated. Each mutating method is one isolated unit:
//! preconditions are re-checked by the storage engine inside the unit, never
//! from an earlier read in application memory.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryCreditStore`] - a single mutex guards all state; used in tests
//!   and single-process deployments.
//! - `SqliteCreditStore` (feature `sqlite`) - durable, guarded `UPDATE`s and a
//!   `UNIQUE(signer, service, nonce)` constraint inside `BEGIN IMMEDIATE`
//!   transactions.
//!
//! # Atomic debit ordering
//!
//! [`CreditStore::debit`] performs, in one unit: nonce claim, guarded
//! decrement, ledger append. A failure at any step leaves no trace of the
//! others, so a replayed payload never costs credits and never refunds the
//! credits spent by the original request.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryCreditStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCreditStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credits::OutOfRange;
use crate::ledger::{
    BalanceChange, CreditBalance, DebitContext, DebitReceipt, LedgerEntry, LedgerSink,
    ReplayAttempt, SyncApplied, SyncCommit,
};
use crate::nonce::{NonceClaim, NonceGuard};
use crate::pricing::ServicePricing;
use crate::timestamp::UnixTimestamp;
use crate::wallet::WalletKey;

/// Errors raised by [`CreditStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The wallet cannot cover the requested debit.
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits {
        /// Balance at the time of the attempt.
        balance: u64,
        /// Credits the debit required.
        required: u64,
    },
    /// The nonce tuple has already been recorded.
    #[error("nonce {nonce} already used by {signer} for {service}")]
    ReplayDetected {
        /// Signer of the replayed payload.
        signer: WalletKey,
        /// Service slug.
        service: String,
        /// Reused nonce.
        nonce: String,
    },
    /// A credit value left the permitted range.
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),
    /// A zero or otherwise meaningless amount was supplied.
    #[error("invalid amount for {0}: must be greater than zero")]
    InvalidAmount(&'static str),
    /// The sync cursor moved since the scan started.
    #[error("sync cursor moved: expected {expected:?}, found {actual:?}")]
    CursorConflict {
        /// Cursor the scan started from.
        expected: Option<u64>,
        /// Cursor found at commit time.
        actual: Option<u64>,
    },
    /// Storage engine failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Strategies fixed at store construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOptions {
    /// Ledger journaling.
    #[serde(default)]
    pub ledger: LedgerSink,
    /// Nonce deduplication.
    #[serde(default)]
    pub nonces: NonceGuard,
}

/// Durable balances, nonces, ledger and pricing.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// The wallet's balance row, if it exists.
    async fn balance(&self, wallet: &WalletKey) -> Result<Option<CreditBalance>, StoreError>;

    /// Spendable credits; `0` for unknown wallets.
    async fn get_balance(&self, wallet: &WalletKey) -> Result<u64, StoreError> {
        Ok(self.balance(wallet).await?.map_or(0, |b| b.credits))
    }

    /// Atomically claims the context's nonce (per the store's [`NonceGuard`]),
    /// decrements `cost` if the balance covers it, and journals a DEBIT entry
    /// (per the store's [`LedgerSink`]).
    async fn debit(
        &self,
        wallet: &WalletKey,
        cost: u64,
        context: DebitContext,
    ) -> Result<DebitReceipt, StoreError>;

    /// Atomically adds `amount`, creating the row if absent.
    async fn credit(
        &self,
        wallet: &WalletKey,
        amount: u64,
        reason: &str,
    ) -> Result<BalanceChange, StoreError>;

    /// Overrides the balance, journaling the signed delta as an ADJUSTMENT.
    async fn set_balance(
        &self,
        wallet: &WalletKey,
        credits: u64,
        reason: &str,
    ) -> Result<BalanceChange, StoreError>;

    /// Records a nonce outside of a debit. Returns `true` if accepted.
    ///
    /// With [`NonceGuard::Disabled`] every claim is accepted and nothing is
    /// stored.
    async fn try_accept_nonce(&self, claim: NonceClaim) -> Result<bool, StoreError>;

    /// Applies a synchronized scan: adds credits, stores the residual wei and
    /// advances the cursor, only if the cursor still equals
    /// [`SyncCommit::expected_cursor`].
    async fn apply_sync(&self, commit: SyncCommit) -> Result<SyncApplied, StoreError>;

    /// Pricing row of a service.
    async fn pricing(&self, service: &str) -> Result<Option<ServicePricing>, StoreError>;

    /// Inserts or replaces a pricing row.
    async fn upsert_pricing(&self, pricing: ServicePricing) -> Result<(), StoreError>;

    /// Ledger entries of a wallet in write order, optionally from `since`.
    async fn ledger_entries(
        &self,
        wallet: &WalletKey,
        since: Option<UnixTimestamp>,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// All balance rows.
    async fn wallets(&self) -> Result<Vec<CreditBalance>, StoreError>;

    /// Appends a rejected replay for monitoring.
    async fn record_replay(&self, attempt: ReplayAttempt) -> Result<(), StoreError>;

    /// Replays observed at or after `since`.
    async fn replay_attempts_since(
        &self,
        since: UnixTimestamp,
    ) -> Result<Vec<ReplayAttempt>, StoreError>;
}

/// Builds the ADJUSTMENT delta between two balances.
pub(crate) fn adjustment_delta(before: u64, after: u64) -> i64 {
    // Both sides are within MAX_CREDITS, which fits i64.
    i64::try_from(after).unwrap_or(i64::MAX) - i64::try_from(before).unwrap_or(i64::MAX)
}

/// Ledger metadata for a synchronized scan.
pub(crate) fn sync_metadata(commit: &SyncCommit) -> serde_json::Value {
    serde_json::json!({
        "fromCursor": commit.expected_cursor,
        "toBlock": commit.scanned_to_block,
        "matchedDeposits": commit.matched_deposits,
        "depositedWei": commit.deposited_wei.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour shared by every backend, run against each one.

    use std::sync::Arc;

    use alloy_primitives::U256;

    use super::*;
    use crate::credits::MAX_CREDITS;
    use crate::ledger::LedgerDirection;

    pub fn wallet(n: u8) -> WalletKey {
        WalletKey::from(alloy_primitives::Address::repeat_byte(n))
    }

    pub fn claim(signer: &WalletKey, nonce: &str) -> NonceClaim {
        NonceClaim {
            signer: signer.clone(),
            service: "weather".into(),
            nonce: nonce.into(),
            payload_timestamp: UnixTimestamp::from_secs(1_700_000_000),
            signature: "0xsig".into(),
        }
    }

    pub fn gate_context(signer: &WalletKey, nonce: &str) -> DebitContext {
        DebitContext {
            reason: "gate:weather".into(),
            service: Some("weather".into()),
            nonce: Some(claim(signer, nonce)),
            request_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub async fn unknown_wallet_has_zero(store: &dyn CreditStore) {
        assert_eq!(store.get_balance(&wallet(1)).await.unwrap(), 0);
        assert!(store.balance(&wallet(1)).await.unwrap().is_none());
    }

    pub async fn credit_then_debit(store: &dyn CreditStore) {
        let w = wallet(2);
        let change = store.credit(&w, 10, "grant").await.unwrap();
        assert_eq!((change.before, change.after), (0, 10));
        let receipt = store.debit(&w, 3, gate_context(&w, "n1")).await.unwrap();
        assert_eq!((receipt.before, receipt.after), (10, 7));
        assert!(receipt.nonce_accepted);
        assert_eq!(store.get_balance(&w).await.unwrap(), 7);
    }

    pub async fn insufficient_debit_has_no_side_effects(store: &dyn CreditStore) {
        let w = wallet(3);
        store.credit(&w, 2, "grant").await.unwrap();
        let err = store.debit(&w, 5, gate_context(&w, "n1")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientCredits {
                balance: 2,
                required: 5
            }
        ));
        assert_eq!(store.get_balance(&w).await.unwrap(), 2);
        // The nonce was not consumed by the failed unit.
        assert!(store.try_accept_nonce(claim(&w, "n1")).await.unwrap());
        let entries = store.ledger_entries(&w, None).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    pub async fn replay_rolls_back_debit(store: &dyn CreditStore) {
        let w = wallet(4);
        store.credit(&w, 10, "grant").await.unwrap();
        store.debit(&w, 1, gate_context(&w, "dup")).await.unwrap();
        let err = store.debit(&w, 1, gate_context(&w, "dup")).await.unwrap_err();
        assert!(matches!(err, StoreError::ReplayDetected { .. }));
        // Balance reflects exactly one debit: no double spend, no refund.
        assert_eq!(store.get_balance(&w).await.unwrap(), 9);
        let debits = store
            .ledger_entries(&w, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.direction == LedgerDirection::Debit)
            .count();
        assert_eq!(debits, 1);
    }

    pub async fn ledger_sum_matches_balance(store: &dyn CreditStore) {
        let w = wallet(5);
        store.credit(&w, 50, "grant").await.unwrap();
        store.debit(&w, 7, gate_context(&w, "a")).await.unwrap();
        store.set_balance(&w, 20, "support").await.unwrap();
        store.debit(&w, 4, gate_context(&w, "b")).await.unwrap();
        store.set_balance(&w, 30, "support").await.unwrap();
        let entries = store.ledger_entries(&w, None).await.unwrap();
        let sum: i64 = entries.iter().map(LedgerEntry::signed_amount).sum();
        assert_eq!(sum, 30);
        assert_eq!(store.get_balance(&w).await.unwrap(), 30);
        for pair in entries.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
        assert_eq!(entries[2].direction, LedgerDirection::Adjustment);
        assert_eq!(entries[2].amount, -23);
    }

    pub async fn range_is_enforced(store: &dyn CreditStore) {
        let w = wallet(6);
        store.credit(&w, MAX_CREDITS, "grant").await.unwrap();
        let err = store.credit(&w, 1, "grant").await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)));
        assert_eq!(store.get_balance(&w).await.unwrap(), MAX_CREDITS);
        assert!(matches!(
            store.set_balance(&w, MAX_CREDITS + 1, "x").await,
            Err(StoreError::OutOfRange(_))
        ));
        assert!(matches!(
            store.credit(&w, 0, "x").await,
            Err(StoreError::InvalidAmount(_))
        ));
    }

    pub async fn concurrent_debits_never_overspend(store: Arc<dyn CreditStore>) {
        let w = wallet(7);
        let (balance, cost, attempts) = (100_u64, 7_u64, 40_usize);
        store.credit(&w, balance, "grant").await.unwrap();
        let mut handles = Vec::with_capacity(attempts);
        for i in 0..attempts {
            let store = Arc::clone(&store);
            let w = w.clone();
            handles.push(tokio::spawn(async move {
                store.debit(&w, cost, gate_context(&w, &format!("c{i}"))).await
            }));
        }
        let mut ok = 0_u64;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::InsufficientCredits { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, balance / cost);
        assert_eq!(
            store.get_balance(&w).await.unwrap(),
            balance - cost * (balance / cost)
        );
    }

    pub async fn sync_is_cursor_guarded(store: &dyn CreditStore) {
        let w = wallet(8);
        let commit = SyncCommit {
            wallet: w.clone(),
            expected_cursor: None,
            scanned_to_block: 100,
            added_credits: 5,
            residual_wei: U256::from(42u8),
            matched_deposits: 1,
            deposited_wei: U256::from(5_000_042u64),
        };
        let applied = store.apply_sync(commit.clone()).await.unwrap();
        assert_eq!(applied.balance.credits, 5);
        assert_eq!(applied.balance.last_synced_block, Some(100));
        assert_eq!(applied.balance.residual_wei, U256::from(42u8));

        // A second commit from the same starting cursor is rejected.
        let err = store.apply_sync(commit).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::CursorConflict {
                expected: None,
                actual: Some(100)
            }
        ));
        assert_eq!(store.get_balance(&w).await.unwrap(), 5);

        // Zero-credit commits still advance the cursor.
        let applied = store
            .apply_sync(SyncCommit {
                wallet: w.clone(),
                expected_cursor: Some(100),
                scanned_to_block: 150,
                added_credits: 0,
                residual_wei: U256::from(42u8),
                matched_deposits: 0,
                deposited_wei: U256::ZERO,
            })
            .await
            .unwrap();
        assert_eq!(applied.added_credits, 0);
        assert_eq!(applied.balance.last_synced_block, Some(150));

        // The cursor never regresses.
        let applied = store
            .apply_sync(SyncCommit {
                wallet: w.clone(),
                expected_cursor: Some(150),
                scanned_to_block: 120,
                added_credits: 0,
                residual_wei: U256::from(42u8),
                matched_deposits: 0,
                deposited_wei: U256::ZERO,
            })
            .await
            .unwrap();
        assert_eq!(applied.balance.last_synced_block, Some(150));
    }

    pub async fn pricing_roundtrip(store: &dyn CreditStore) {
        assert!(store.pricing("weather").await.unwrap().is_none());
        store
            .upsert_pricing(ServicePricing {
                service: "weather".into(),
                cost: 3,
                is_active: true,
            })
            .await
            .unwrap();
        store
            .upsert_pricing(ServicePricing {
                service: "weather".into(),
                cost: 4,
                is_active: false,
            })
            .await
            .unwrap();
        let p = store.pricing("weather").await.unwrap().unwrap();
        assert_eq!((p.cost, p.is_active), (4, false));
    }

    pub async fn replays_are_queryable(store: &dyn CreditStore) {
        let w = wallet(9);
        for (i, at) in [10_u64, 20, 30].into_iter().enumerate() {
            store
                .record_replay(ReplayAttempt {
                    signer: w.clone(),
                    service: "weather".into(),
                    nonce: format!("r{i}"),
                    observed_at: UnixTimestamp::from_secs(at),
                })
                .await
                .unwrap();
        }
        let recent = store
            .replay_attempts_since(UnixTimestamp::from_secs(20))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }
}

//! Folding on-chain deposits into spendable credits.
//!
//! A [`DepositSource`] reports the deposits of one payer over a bounded block
//! range starting after the wallet's cursor. [`CreditSynchronizer`] converts the
//! gross deposited wei into whole credits (carrying the remainder as residual
//! wei) and commits credits, residual and cursor in one
//! [`CreditStore::apply_sync`] call guarded by the cursor the scan started
//! from. Re-running a sync over a range that was already applied adds nothing.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::credits::{self, OutOfRange};
use crate::ledger::SyncCommit;
use crate::store::{CreditStore, StoreError};
use crate::wallet::WalletKey;

/// Deposits observed for one payer over `[from_block, to_block]`.
///
/// When there is nothing new to scan, `to_block == from_block - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositScan {
    /// First block covered.
    pub from_block: u64,
    /// Last block covered.
    pub to_block: u64,
    /// Chain head when the scan started.
    pub head_block: u64,
    /// Number of matching deposit events.
    pub matched_deposits: u64,
    /// Sum of matching deposit amounts.
    pub deposited_wei: U256,
    /// `true` if the scan stopped before the head.
    pub partial_sync: bool,
    /// Where the next scan will start.
    pub next_from_block: u64,
}

impl DepositScan {
    /// Whether the scan covered at least one block.
    #[must_use]
    pub const fn covers_blocks(&self) -> bool {
        self.to_block >= self.from_block
    }
}

/// A deposit scan failed; nothing was applied.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The provider kept rejecting ranges even at the minimum chunk size.
    #[error("provider rejected block range {from}..={to} at minimum chunk size: {detail}")]
    RangeFloor {
        /// First block of the failing chunk.
        from: u64,
        /// Last block of the failing chunk.
        to: u64,
        /// Provider message.
        detail: String,
    },
    /// A provider call exceeded its timeout.
    #[error("provider call timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Transport or decoding failure.
    #[error("provider error: {0}")]
    Provider(String),
}

/// Source of deposit events for a payer.
#[async_trait]
pub trait DepositSource: Send + Sync {
    /// Scans deposits made by `payer` after `cursor`.
    async fn scan(&self, payer: &WalletKey, cursor: Option<u64>) -> Result<DepositScan, ScanError>;
}

/// Failures of a sync pass.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The deposit scan failed.
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// Another sync advanced the cursor first.
    #[error("concurrent sync moved the cursor from {expected:?} to {actual:?}")]
    Conflict {
        /// Cursor this pass started from.
        expected: Option<u64>,
        /// Cursor found at commit time.
        actual: Option<u64>,
    },
    /// Credit conversion overflowed.
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),
    /// Storage failure.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CursorConflict { expected, actual } => Self::Conflict { expected, actual },
            StoreError::OutOfRange(e) => Self::OutOfRange(e),
            other => Self::Store(other),
        }
    }
}

impl SyncError {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Conflict { .. } => 409,
            Self::Scan(_) | Self::OutOfRange(_) | Self::Store(_) => 500,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "SYNC_CONFLICT",
            Self::Scan(_) => "SCAN_FAILED",
            Self::OutOfRange(_) | Self::Store(_) => "INTERNAL_ERROR",
        }
    }
}

/// The credit price must be positive.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("credit price must be greater than zero wei")]
pub struct ZeroCreditPrice;

fn serialize_decimal<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn deserialize_decimal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
    let s = String::deserialize(deserializer)?;
    U256::from_str_radix(&s, 10).map_err(serde::de::Error::custom)
}

/// Result of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    /// Synchronized wallet.
    pub wallet: WalletKey,
    /// First block scanned.
    pub from_block: u64,
    /// Last block scanned.
    pub to_block: u64,
    /// Chain head at scan time.
    pub head_block: u64,
    /// Deposit events folded in.
    pub matched_deposits: u64,
    /// Gross wei observed, as a decimal string.
    #[serde(serialize_with = "serialize_decimal", deserialize_with = "deserialize_decimal")]
    pub deposited_wei: U256,
    /// Credits added by this pass.
    pub added_credits: u64,
    /// Balance after the pass.
    pub credits: u64,
    /// Cursor after the pass.
    pub last_synced_block: Option<u64>,
    /// `true` if more blocks remain before the head.
    pub partial_sync: bool,
    /// Where the next pass starts.
    pub next_from_block: u64,
}

/// Converts deposits into credits.
#[derive(Clone)]
pub struct CreditSynchronizer {
    store: Arc<dyn CreditStore>,
    source: Arc<dyn DepositSource>,
    credit_price_wei: U256,
}

impl fmt::Debug for CreditSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreditSynchronizer")
            .field("credit_price_wei", &self.credit_price_wei)
            .finish_non_exhaustive()
    }
}

impl CreditSynchronizer {
    /// Creates a synchronizer charging `credit_price_wei` per credit.
    ///
    /// # Errors
    ///
    /// Returns [`ZeroCreditPrice`] for a zero price.
    pub fn new(
        store: Arc<dyn CreditStore>,
        source: Arc<dyn DepositSource>,
        credit_price_wei: U256,
    ) -> Result<Self, ZeroCreditPrice> {
        if credit_price_wei.is_zero() {
            return Err(ZeroCreditPrice);
        }
        Ok(Self {
            store,
            source,
            credit_price_wei,
        })
    }

    /// Wei charged per credit.
    #[must_use]
    pub const fn credit_price_wei(&self) -> U256 {
        self.credit_price_wei
    }

    /// Runs one bounded sync pass for `wallet`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if the scan fails, the cursor moved during the
    /// scan, or the store rejects the commit. Nothing is applied on error.
    pub async fn sync_wallet(&self, wallet: &WalletKey) -> Result<SyncOutcome, SyncError> {
        let current = self.store.balance(wallet).await?;
        let cursor = current.as_ref().and_then(|b| b.last_synced_block);
        let residual = current.as_ref().map_or(U256::ZERO, |b| b.residual_wei);

        let scan = self.source.scan(wallet, cursor).await?;
        if !scan.covers_blocks() {
            return Ok(SyncOutcome {
                wallet: wallet.clone(),
                from_block: scan.from_block,
                to_block: scan.to_block,
                head_block: scan.head_block,
                matched_deposits: 0,
                deposited_wei: U256::ZERO,
                added_credits: 0,
                credits: current.as_ref().map_or(0, |b| b.credits),
                last_synced_block: cursor,
                partial_sync: false,
                next_from_block: scan.next_from_block,
            });
        }

        let (added, residual) =
            credits::wei_to_credits(residual, scan.deposited_wei, self.credit_price_wei)?;
        let applied = self
            .store
            .apply_sync(SyncCommit {
                wallet: wallet.clone(),
                expected_cursor: cursor,
                scanned_to_block: scan.to_block,
                added_credits: added,
                residual_wei: residual,
                matched_deposits: scan.matched_deposits,
                deposited_wei: scan.deposited_wei,
            })
            .await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(
            wallet = %wallet,
            from = scan.from_block,
            to = scan.to_block,
            matched = scan.matched_deposits,
            added = applied.added_credits,
            partial = scan.partial_sync,
            "deposit sync applied"
        );

        Ok(SyncOutcome {
            wallet: wallet.clone(),
            from_block: scan.from_block,
            to_block: scan.to_block,
            head_block: scan.head_block,
            matched_deposits: scan.matched_deposits,
            deposited_wei: scan.deposited_wei,
            added_credits: applied.added_credits,
            credits: applied.balance.credits,
            last_synced_block: applied.balance.last_synced_block,
            partial_sync: scan.partial_sync,
            next_from_block: scan.next_from_block,
        })
    }

    /// Runs one pass for every wallet the store knows. Failures are collected
    /// per wallet and do not stop the batch.
    pub async fn sync_known_wallets(&self) -> Vec<(WalletKey, Result<SyncOutcome, SyncError>)> {
        let wallets = match self.store.wallets().await {
            Ok(rows) => rows,
            Err(_err) => {
                #[cfg(feature = "telemetry")]
                tracing::error!(error = %_err, "cannot list wallets for sync");
                return Vec::new();
            }
        };
        let mut results = Vec::with_capacity(wallets.len());
        for row in wallets {
            let outcome = self.sync_wallet(&row.wallet).await;
            results.push((row.wallet, outcome));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::{InMemoryCreditStore, StoreOptions};

    const PRICE: u64 = 10_000_000_000_000;

    /// A chain of deposits for a single payer, scanned at most `span` blocks
    /// at a time.
    struct ScriptedChain {
        deployment_block: u64,
        head: u64,
        span: u64,
        deposits: Vec<(u64, U256)>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl DepositSource for ScriptedChain {
        async fn scan(
            &self,
            _payer: &WalletKey,
            cursor: Option<u64>,
        ) -> Result<DepositScan, ScanError> {
            *self.calls.lock().unwrap() += 1;
            let from = cursor.map_or(self.deployment_block, |c| c + 1).max(self.deployment_block);
            if from > self.head {
                return Ok(DepositScan {
                    from_block: from,
                    to_block: from - 1,
                    head_block: self.head,
                    matched_deposits: 0,
                    deposited_wei: U256::ZERO,
                    partial_sync: false,
                    next_from_block: from,
                });
            }
            let to = (from + self.span - 1).min(self.head);
            let hits: Vec<_> = self
                .deposits
                .iter()
                .filter(|(b, _)| (from..=to).contains(b))
                .collect();
            Ok(DepositScan {
                from_block: from,
                to_block: to,
                head_block: self.head,
                matched_deposits: hits.len() as u64,
                deposited_wei: hits.iter().fold(U256::ZERO, |acc, (_, a)| acc + *a),
                partial_sync: to < self.head,
                next_from_block: to + 1,
            })
        }
    }

    struct FailingChain;

    #[async_trait]
    impl DepositSource for FailingChain {
        async fn scan(&self, _: &WalletKey, _: Option<u64>) -> Result<DepositScan, ScanError> {
            Err(ScanError::Provider("connection refused".into()))
        }
    }

    fn payer() -> WalletKey {
        "0x00000000000000000000000000000000000000bb".parse().unwrap()
    }

    fn chain(span: u64, deposits: Vec<(u64, U256)>) -> Arc<ScriptedChain> {
        Arc::new(ScriptedChain {
            deployment_block: 100,
            head: 200,
            span,
            deposits,
            calls: Mutex::new(0),
        })
    }

    fn synchronizer(source: Arc<dyn DepositSource>) -> (CreditSynchronizer, Arc<InMemoryCreditStore>) {
        let store = Arc::new(InMemoryCreditStore::new(StoreOptions::default()));
        let sync = CreditSynchronizer::new(store.clone(), source, U256::from(PRICE)).unwrap();
        (sync, store)
    }

    #[tokio::test]
    async fn test_two_eth_deposit_yields_two_hundred_thousand_credits() {
        let two_eth = U256::from(2_000_000_000_000_000_000_u128);
        let (sync, store) = synchronizer(chain(1_000, vec![(150, two_eth)]));
        let outcome = sync.sync_wallet(&payer()).await.unwrap();
        assert_eq!(outcome.added_credits, 200_000);
        assert_eq!(outcome.credits, 200_000);
        assert_eq!(outcome.from_block, 100);
        assert_eq!(outcome.last_synced_block, Some(200));
        assert!(!outcome.partial_sync);
        assert_eq!(store.get_balance(&payer()).await.unwrap(), 200_000);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let (sync, store) = synchronizer(chain(1_000, vec![(120, U256::from(PRICE * 4))]));
        sync.sync_wallet(&payer()).await.unwrap();
        let again = sync.sync_wallet(&payer()).await.unwrap();
        assert_eq!(again.added_credits, 0);
        assert_eq!(store.get_balance(&payer()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_partial_scans_converge_to_floor_of_total() {
        // Each deposit is 1.5 credits; per-call floors would lose the halves.
        let half_and_one = U256::from(PRICE + PRICE / 2);
        let deposits = vec![(105, half_and_one), (135, half_and_one), (165, half_and_one)];
        let (sync, store) = synchronizer(chain(30, deposits));
        let mut passes = 0;
        loop {
            passes += 1;
            let outcome = sync.sync_wallet(&payer()).await.unwrap();
            if !outcome.partial_sync {
                break;
            }
            assert_eq!(outcome.next_from_block, outcome.to_block + 1);
        }
        assert!(passes > 1);
        // floor(4.5) = 4
        assert_eq!(store.get_balance(&payer()).await.unwrap(), 4);
        let row = store.balance(&payer()).await.unwrap().unwrap();
        assert_eq!(row.residual_wei, U256::from(PRICE / 2));
        assert_eq!(row.last_synced_block, Some(200));
    }

    #[tokio::test]
    async fn test_empty_scan_advances_cursor() {
        let (sync, store) = synchronizer(chain(1_000, vec![]));
        let outcome = sync.sync_wallet(&payer()).await.unwrap();
        assert_eq!(outcome.added_credits, 0);
        assert_eq!(outcome.last_synced_block, Some(200));
        let row = store.balance(&payer()).await.unwrap().unwrap();
        assert_eq!(row.credits, 0);
        assert!(store.ledger_entries(&payer(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_applies_nothing() {
        let (sync, store) = synchronizer(Arc::new(FailingChain));
        let err = sync.sync_wallet(&payer()).await.unwrap_err();
        assert_eq!(err.code(), "SCAN_FAILED");
        assert!(store.balance(&payer()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_known_wallets_covers_store() {
        let source = chain(1_000, vec![(110, U256::from(PRICE * 2))]);
        let (sync, store) = synchronizer(source.clone());
        store.credit(&payer(), 1, "grant").await.unwrap();
        let results = sync.sync_known_wallets().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.as_ref().unwrap().credits, 3);
        assert_eq!(*source.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_zero_price_rejected() {
        let store = Arc::new(InMemoryCreditStore::new(StoreOptions::default()));
        assert!(CreditSynchronizer::new(store, Arc::new(FailingChain), U256::ZERO).is_err());
    }

    #[test]
    fn test_outcome_serializes_decimal_wei() {
        let outcome = SyncOutcome {
            wallet: payer(),
            from_block: 1,
            to_block: 2,
            head_block: 2,
            matched_deposits: 1,
            deposited_wei: U256::from(1_000_000_000_000_000_000_u128),
            added_credits: 100_000,
            credits: 100_000,
            last_synced_block: Some(2),
            partial_sync: false,
            next_from_block: 3,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["depositedWei"], "1000000000000000000");
        assert_eq!(json["lastSyncedBlock"], 2);
    }
}

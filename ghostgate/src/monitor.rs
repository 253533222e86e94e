//! Batch consistency checks run by the server's background jobs.
//!
//! [`LedgerReconciler`] compares every balance with the signed sum of its
//! ledger entries. [`ReplayMonitor`] counts rejected replays over a sliding
//! window and flags spikes, overall and per signer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ledger::LedgerEntry;
use crate::store::{CreditStore, StoreError};
use crate::timestamp::UnixTimestamp;
use crate::wallet::WalletKey;

/// A wallet whose balance disagrees with its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDrift {
    /// Affected wallet.
    pub wallet: WalletKey,
    /// Stored balance.
    pub credits: u64,
    /// Signed sum of the wallet's ledger entries.
    pub ledger_sum: i64,
    /// Number of entries whose `balance_before` does not match the previous
    /// entry's `balance_after`.
    pub broken_links: usize,
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Wallets inspected.
    pub wallets_checked: usize,
    /// Wallets out of balance.
    pub drifts: Vec<LedgerDrift>,
}

impl ReconcileReport {
    /// `true` when no drift was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty()
    }
}

/// Detects drift between balances and the ledger.
#[derive(Clone)]
pub struct LedgerReconciler {
    store: Arc<dyn CreditStore>,
}

impl std::fmt::Debug for LedgerReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerReconciler").finish_non_exhaustive()
    }
}

fn broken_links(entries: &[LedgerEntry]) -> usize {
    entries
        .windows(2)
        .filter(|w| w[0].balance_after != w[1].balance_before)
        .count()
}

impl LedgerReconciler {
    /// Creates a reconciler over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Checks every known wallet.
    ///
    /// Only meaningful for stores whose ledger has been persistent since the
    /// wallet was created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if balances or entries cannot be read.
    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let wallets = self.store.wallets().await?;
        let mut report = ReconcileReport {
            wallets_checked: wallets.len(),
            drifts: Vec::new(),
        };
        for row in wallets {
            let entries = self.store.ledger_entries(&row.wallet, None).await?;
            let ledger_sum: i64 = entries.iter().map(LedgerEntry::signed_amount).sum();
            let links = broken_links(&entries);
            let matches = u64::try_from(ledger_sum).is_ok_and(|sum| sum == row.credits);
            if !matches || links > 0 {
                #[cfg(feature = "telemetry")]
                tracing::warn!(
                    wallet = %row.wallet,
                    credits = row.credits,
                    ledger_sum,
                    broken_links = links,
                    "ledger drift detected"
                );
                report.drifts.push(LedgerDrift {
                    wallet: row.wallet,
                    credits: row.credits,
                    ledger_sum,
                    broken_links: links,
                });
            }
        }
        #[cfg(feature = "telemetry")]
        tracing::info!(
            wallets = report.wallets_checked,
            drifts = report.drifts.len(),
            "ledger reconciliation finished"
        );
        Ok(report)
    }
}

/// Thresholds of the replay monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayThresholds {
    /// Sliding window in seconds.
    pub window_secs: u64,
    /// Replays across all signers that constitute a spike.
    pub total: usize,
    /// Replays by a single signer that constitute a spike.
    pub per_signer: usize,
}

impl Default for ReplayThresholds {
    fn default() -> Self {
        Self {
            window_secs: 300,
            total: 25,
            per_signer: 5,
        }
    }
}

/// Replay activity within one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// Replays in the window.
    pub total: usize,
    /// `true` if `total` reached the threshold.
    pub spike: bool,
    /// Signers at or above the per-signer threshold, with their counts.
    pub offenders: Vec<(WalletKey, usize)>,
}

/// Flags bursts of rejected replays.
#[derive(Clone)]
pub struct ReplayMonitor {
    store: Arc<dyn CreditStore>,
    thresholds: ReplayThresholds,
}

impl std::fmt::Debug for ReplayMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayMonitor")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl ReplayMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(store: Arc<dyn CreditStore>, thresholds: ReplayThresholds) -> Self {
        Self { store, thresholds }
    }

    /// Inspects the window ending at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if replay attempts cannot be read.
    pub async fn check_at(&self, now: UnixTimestamp) -> Result<ReplayReport, StoreError> {
        let since = UnixTimestamp::from_secs(now.as_secs().saturating_sub(self.thresholds.window_secs));
        let attempts = self.store.replay_attempts_since(since).await?;

        let mut by_signer: BTreeMap<WalletKey, usize> = BTreeMap::new();
        for attempt in &attempts {
            *by_signer.entry(attempt.signer.clone()).or_default() += 1;
        }
        let offenders: Vec<_> = by_signer
            .into_iter()
            .filter(|(_, count)| *count >= self.thresholds.per_signer)
            .collect();
        let report = ReplayReport {
            total: attempts.len(),
            spike: attempts.len() >= self.thresholds.total,
            offenders,
        };

        #[cfg(feature = "telemetry")]
        if report.spike || !report.offenders.is_empty() {
            tracing::warn!(
                total = report.total,
                window_secs = self.thresholds.window_secs,
                offenders = ?report.offenders,
                "replay attempt spike"
            );
        }
        Ok(report)
    }

    /// Inspects the window ending now.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if replay attempts cannot be read.
    pub async fn check(&self) -> Result<ReplayReport, StoreError> {
        self.check_at(UnixTimestamp::now()).await
    }
}

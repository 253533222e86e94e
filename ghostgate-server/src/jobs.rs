//! Periodic background work.
//!
//! - sync pass over every known wallet
//! - ledger reconciliation
//! - replay spike check
//!
//! Each job runs on its own [`tokio::time::interval`] and stops when the
//! shutdown token is cancelled. A failing run is logged and retried on the
//! next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ghostgate::monitor::{LedgerReconciler, ReplayMonitor, ReplayThresholds};
use ghostgate::store::CreditStore;
use ghostgate::sync::CreditSynchronizer;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::JobsConfig;

/// Runs `tick` every `period` until `token` is cancelled.
///
/// The first run happens one full period after start.
pub async fn every<F, Fut>(period: Duration, token: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => tick().await,
        }
    }
}

/// One sync pass over every known wallet; returns the number of failures.
pub async fn sync_pass(sync: &CreditSynchronizer) -> usize {
    let results = sync.sync_known_wallets().await;
    let mut failed = 0;
    for (wallet, result) in &results {
        match result {
            Ok(outcome) if outcome.added_credits > 0 => tracing::info!(
                %wallet,
                added = outcome.added_credits,
                credits = outcome.credits,
                partial = outcome.partial_sync,
                "synced deposits"
            ),
            Ok(_) => {}
            Err(err) => {
                failed += 1;
                tracing::warn!(%wallet, code = err.code(), "sync failed: {err}");
            }
        }
    }
    tracing::debug!(wallets = results.len(), failed, "sync pass finished");
    failed
}

/// One reconciliation run; returns `true` if the ledger is consistent.
pub async fn reconcile(reconciler: &LedgerReconciler) -> bool {
    match reconciler.reconcile().await {
        Ok(report) => {
            for drift in &report.drifts {
                tracing::error!(
                    wallet = %drift.wallet,
                    credits = drift.credits,
                    ledger_sum = drift.ledger_sum,
                    broken_links = drift.broken_links,
                    "ledger drift"
                );
            }
            report.is_clean()
        }
        Err(err) => {
            tracing::error!("reconciliation failed: {err}");
            false
        }
    }
}

/// One replay check; returns `true` if a spike was flagged.
pub async fn replay_check(monitor: &ReplayMonitor) -> bool {
    match monitor.check().await {
        Ok(report) => report.spike || !report.offenders.is_empty(),
        Err(err) => {
            tracing::error!("replay check failed: {err}");
            false
        }
    }
}

/// Spawns every enabled job on `tasks`.
pub fn spawn(
    tasks: &TaskTracker,
    token: &CancellationToken,
    config: JobsConfig,
    store: &Arc<dyn CreditStore>,
    sync: Option<Arc<CreditSynchronizer>>,
    thresholds: ReplayThresholds,
) {
    if let Some(sync) = sync.filter(|_| config.sync_interval_secs > 0) {
        let period = Duration::from_secs(config.sync_interval_secs);
        tracing::info!(?period, "scheduling deposit sync");
        tasks.spawn(every(period, token.clone(), move || {
            let sync = Arc::clone(&sync);
            async move {
                sync_pass(&sync).await;
            }
        }));
    }

    if config.reconcile_interval_secs > 0 {
        let period = Duration::from_secs(config.reconcile_interval_secs);
        let reconciler = Arc::new(LedgerReconciler::new(Arc::clone(store)));
        tracing::info!(?period, "scheduling ledger reconciliation");
        tasks.spawn(every(period, token.clone(), move || {
            let reconciler = Arc::clone(&reconciler);
            async move {
                reconcile(&reconciler).await;
            }
        }));
    }

    if config.replay_check_interval_secs > 0 {
        let period = Duration::from_secs(config.replay_check_interval_secs);
        let monitor = Arc::new(ReplayMonitor::new(Arc::clone(store), thresholds));
        tracing::info!(?period, "scheduling replay monitor");
        tasks.spawn(every(period, token.clone(), move || {
            let monitor = Arc::clone(&monitor);
            async move {
                replay_check(&monitor).await;
            }
        }));
    }
}

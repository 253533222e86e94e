//! Process-local [`CreditStore`] backed by a single mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{CreditStore, StoreError, StoreOptions, adjustment_delta, sync_metadata};
use crate::credits::{self, MAX_CREDITS};
use crate::ledger::{
    BalanceChange, CreditBalance, DebitContext, DebitReceipt, LedgerDirection, LedgerEntry,
    ReplayAttempt, SyncApplied, SyncCommit,
};
use crate::nonce::NonceClaim;
use crate::pricing::ServicePricing;
use crate::timestamp::UnixTimestamp;
use crate::wallet::WalletKey;

type NonceKey = (WalletKey, String, String);

#[derive(Debug, Default)]
struct State {
    balances: HashMap<WalletKey, CreditBalance>,
    ledger: Vec<LedgerEntry>,
    nonces: HashSet<NonceKey>,
    pricing: HashMap<String, ServicePricing>,
    replays: Vec<ReplayAttempt>,
}

impl State {
    fn credits_of(&self, wallet: &WalletKey) -> u64 {
        self.balances.get(wallet).map_or(0, |b| b.credits)
    }

    fn row_mut(&mut self, wallet: &WalletKey, now: UnixTimestamp) -> &mut CreditBalance {
        self.balances
            .entry(wallet.clone())
            .or_insert_with(|| CreditBalance::empty(wallet.clone(), now))
    }
}

/// All state lives behind one lock, so every trait method is trivially a
/// single isolated unit. Nonces are unique under every [`NonceGuard`] mode
/// that records them.
///
/// [`NonceGuard`]: crate::nonce::NonceGuard
#[derive(Debug, Default)]
pub struct InMemoryCreditStore {
    options: StoreOptions,
    state: Mutex<State>,
}

impl InMemoryCreditStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".into()))
    }

    fn journal(&self, state: &mut State, entry: LedgerEntry) {
        if let Some(entry) = self.options.ledger.admit(entry) {
            state.ledger.push(entry);
        }
    }
}

fn nonce_key(claim: &NonceClaim) -> NonceKey {
    (claim.signer.clone(), claim.service.clone(), claim.nonce.clone())
}

fn replay_of(claim: &NonceClaim) -> StoreError {
    StoreError::ReplayDetected {
        signer: claim.signer.clone(),
        service: claim.service.clone(),
        nonce: claim.nonce.clone(),
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn balance(&self, wallet: &WalletKey) -> Result<Option<CreditBalance>, StoreError> {
        Ok(self.lock()?.balances.get(wallet).cloned())
    }

    async fn debit(
        &self,
        wallet: &WalletKey,
        cost: u64,
        context: DebitContext,
    ) -> Result<DebitReceipt, StoreError> {
        if cost == 0 {
            return Err(StoreError::InvalidAmount("debit"));
        }
        let cost = credits::ensure_in_range("debit", cost)?;
        let now = UnixTimestamp::now();
        let mut state = self.lock()?;

        let claim = context.nonce.filter(|_| self.options.nonces.records());
        if let Some(claim) = &claim
            && state.nonces.contains(&nonce_key(claim))
        {
            return Err(replay_of(claim));
        }

        let before = state.credits_of(wallet);
        let after = credits::checked_sub(before, cost).ok_or(StoreError::InsufficientCredits {
            balance: before,
            required: cost,
        })?;

        let nonce_accepted = claim.is_some();
        if let Some(claim) = &claim {
            state.nonces.insert(nonce_key(claim));
        }
        let row = state.row_mut(wallet, now);
        row.credits = after;
        row.updated_at = now;

        self.journal(
            &mut state,
            LedgerEntry {
                wallet: wallet.clone(),
                direction: LedgerDirection::Debit,
                amount: i64::try_from(cost).unwrap_or(i64::MAX),
                balance_before: before,
                balance_after: after,
                reason: context.reason,
                service: context.service,
                nonce: claim.map(|c| c.nonce),
                request_id: context.request_id,
                metadata: context.metadata,
                created_at: now,
            },
        );
        Ok(DebitReceipt {
            before,
            after,
            nonce_accepted,
        })
    }

    async fn credit(
        &self,
        wallet: &WalletKey,
        amount: u64,
        reason: &str,
    ) -> Result<BalanceChange, StoreError> {
        if amount == 0 {
            return Err(StoreError::InvalidAmount("credit"));
        }
        let now = UnixTimestamp::now();
        let mut state = self.lock()?;
        let before = state.credits_of(wallet);
        let after = credits::checked_add(before, amount)?;
        let row = state.row_mut(wallet, now);
        row.credits = after;
        row.updated_at = now;
        self.journal(
            &mut state,
            LedgerEntry {
                wallet: wallet.clone(),
                direction: LedgerDirection::Credit,
                amount: i64::try_from(amount).unwrap_or(i64::MAX),
                balance_before: before,
                balance_after: after,
                reason: reason.to_owned(),
                service: None,
                nonce: None,
                request_id: None,
                metadata: serde_json::Value::Null,
                created_at: now,
            },
        );
        Ok(BalanceChange { before, after })
    }

    async fn set_balance(
        &self,
        wallet: &WalletKey,
        credits: u64,
        reason: &str,
    ) -> Result<BalanceChange, StoreError> {
        let after = credits::ensure_in_range("set_balance", credits)?;
        let now = UnixTimestamp::now();
        let mut state = self.lock()?;
        let before = state.credits_of(wallet);
        let row = state.row_mut(wallet, now);
        row.credits = after;
        row.updated_at = now;
        if before != after {
            self.journal(
                &mut state,
                LedgerEntry {
                    wallet: wallet.clone(),
                    direction: LedgerDirection::Adjustment,
                    amount: adjustment_delta(before, after),
                    balance_before: before,
                    balance_after: after,
                    reason: reason.to_owned(),
                    service: None,
                    nonce: None,
                    request_id: None,
                    metadata: serde_json::Value::Null,
                    created_at: now,
                },
            );
        }
        Ok(BalanceChange { before, after })
    }

    async fn try_accept_nonce(&self, claim: NonceClaim) -> Result<bool, StoreError> {
        if !self.options.nonces.records() {
            return Ok(true);
        }
        Ok(self.lock()?.nonces.insert(nonce_key(&claim)))
    }

    async fn apply_sync(&self, commit: SyncCommit) -> Result<SyncApplied, StoreError> {
        let now = UnixTimestamp::now();
        let mut state = self.lock()?;
        let actual = state
            .balances
            .get(&commit.wallet)
            .and_then(|b| b.last_synced_block);
        if actual != commit.expected_cursor {
            return Err(StoreError::CursorConflict {
                expected: commit.expected_cursor,
                actual,
            });
        }
        let before = state.credits_of(&commit.wallet);
        let after = credits::checked_add(before, commit.added_credits)?;

        let row = state.row_mut(&commit.wallet, now);
        row.credits = after;
        row.residual_wei = commit.residual_wei;
        row.last_synced_block = Some(actual.map_or(commit.scanned_to_block, |cursor| {
            cursor.max(commit.scanned_to_block)
        }));
        row.updated_at = now;
        let balance = row.clone();

        if commit.added_credits > 0 {
            self.journal(
                &mut state,
                LedgerEntry {
                    wallet: commit.wallet.clone(),
                    direction: LedgerDirection::Credit,
                    amount: i64::try_from(commit.added_credits).unwrap_or(i64::MAX),
                    balance_before: before,
                    balance_after: after,
                    reason: "deposit-sync".into(),
                    service: None,
                    nonce: None,
                    request_id: None,
                    metadata: sync_metadata(&commit),
                    created_at: now,
                },
            );
        }
        Ok(SyncApplied {
            balance,
            added_credits: commit.added_credits,
        })
    }

    async fn pricing(&self, service: &str) -> Result<Option<ServicePricing>, StoreError> {
        Ok(self.lock()?.pricing.get(service).cloned())
    }

    async fn upsert_pricing(&self, pricing: ServicePricing) -> Result<(), StoreError> {
        if pricing.cost == 0 || pricing.cost > MAX_CREDITS {
            return Err(StoreError::InvalidAmount("pricing cost"));
        }
        self.lock()?.pricing.insert(pricing.service.clone(), pricing);
        Ok(())
    }

    async fn ledger_entries(
        &self,
        wallet: &WalletKey,
        since: Option<UnixTimestamp>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .lock()?
            .ledger
            .iter()
            .filter(|e| &e.wallet == wallet && since.is_none_or(|s| e.created_at >= s))
            .cloned()
            .collect())
    }

    async fn wallets(&self) -> Result<Vec<CreditBalance>, StoreError> {
        let mut rows: Vec<_> = self.lock()?.balances.values().cloned().collect();
        rows.sort_by(|a, b| a.wallet.as_str().cmp(b.wallet.as_str()));
        Ok(rows)
    }

    async fn record_replay(&self, attempt: ReplayAttempt) -> Result<(), StoreError> {
        self.lock()?.replays.push(attempt);
        Ok(())
    }

    async fn replay_attempts_since(
        &self,
        since: UnixTimestamp,
    ) -> Result<Vec<ReplayAttempt>, StoreError> {
        Ok(self
            .lock()?
            .replays
            .iter()
            .filter(|r| r.observed_at >= since)
            .cloned()
            .collect())
    }
}

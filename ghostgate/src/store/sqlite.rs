//! Durable [`CreditStore`] on SQLite.
//!
//! Every mutation runs in a `BEGIN IMMEDIATE` transaction, so the write lock is
//! taken before the first read. Debits decrement with a guarded
//! `UPDATE ... WHERE credits >= ?`; nonces rely on `UNIQUE(signer, service,
//! nonce)`. Dropping a transaction without committing rolls it back, which is
//! how every early `?` return undoes the partial unit.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};

use super::{CreditStore, StoreError, StoreOptions, adjustment_delta, sync_metadata};
use crate::credits::{self, MAX_CREDITS};
use crate::ledger::{
    BalanceChange, CreditBalance, DebitContext, DebitReceipt, LedgerDirection, LedgerEntry,
    ReplayAttempt, SyncApplied, SyncCommit,
};
use crate::nonce::{NonceClaim, NonceGuard};
use crate::pricing::ServicePricing;
use crate::timestamp::UnixTimestamp;
use crate::wallet::WalletKey;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credit_balances (
    wallet            TEXT PRIMARY KEY,
    credits           INTEGER NOT NULL DEFAULT 0 CHECK (credits >= 0),
    last_synced_block INTEGER,
    residual_wei      TEXT NOT NULL DEFAULT '0',
    updated_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS credit_ledger (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet         TEXT NOT NULL,
    direction      TEXT NOT NULL CHECK (direction IN ('CREDIT', 'DEBIT', 'ADJUSTMENT')),
    amount         INTEGER NOT NULL,
    balance_before INTEGER NOT NULL,
    balance_after  INTEGER NOT NULL,
    reason         TEXT NOT NULL,
    service        TEXT,
    nonce          TEXT,
    request_id     TEXT,
    metadata       TEXT NOT NULL DEFAULT 'null',
    created_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_credit_ledger_wallet_time ON credit_ledger(wallet, created_at);

CREATE TABLE IF NOT EXISTS access_nonces (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    signer            TEXT NOT NULL,
    service           TEXT NOT NULL,
    nonce             TEXT NOT NULL,
    payload_timestamp INTEGER NOT NULL,
    signature         TEXT NOT NULL,
    created_at        INTEGER NOT NULL,
    UNIQUE (signer, service, nonce)
);

CREATE TABLE IF NOT EXISTS service_pricing (
    service   TEXT PRIMARY KEY,
    cost      INTEGER NOT NULL CHECK (cost > 0),
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS replay_attempts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    signer      TEXT NOT NULL,
    service     TEXT NOT NULL,
    nonce       TEXT NOT NULL,
    observed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_replay_attempts_observed ON replay_attempts(observed_at);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// SQLite-backed credit store.
///
/// The connection is shared behind a mutex and all statements run on the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteCreditStore {
    conn: Arc<Mutex<Connection>>,
    options: StoreOptions,
}

impl SqliteCreditStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the file cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn, options)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the schema cannot be applied.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, options)
    }

    fn with_connection(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, StoreOptions) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let options = self.options;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
            f(&mut guard, options)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {e}")))?
    }
}

fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("{value} exceeds sqlite INTEGER")))
}

fn from_sql_int(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, value))
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn balance_from_row(row: &Row<'_>) -> rusqlite::Result<CreditBalance> {
    let wallet: String = row.get(0)?;
    let residual: String = row.get(3)?;
    Ok(CreditBalance {
        wallet: wallet.parse().map_err(|e| conversion_error(0, e))?,
        credits: from_sql_int(row.get(1)?)?,
        last_synced_block: row.get::<_, Option<i64>>(2)?.map(from_sql_int).transpose()?,
        residual_wei: residual
            .parse::<U256>()
            .map_err(|e| conversion_error(3, e))?,
        updated_at: UnixTimestamp::from_secs(from_sql_int(row.get(4)?)?),
    })
}

fn ledger_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let wallet: String = row.get(0)?;
    let direction: String = row.get(1)?;
    let metadata: String = row.get(9)?;
    Ok(LedgerEntry {
        wallet: wallet.parse().map_err(|e| conversion_error(0, e))?,
        direction: LedgerDirection::parse(&direction).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(1, direction.clone(), rusqlite::types::Type::Text)
        })?,
        amount: row.get(2)?,
        balance_before: from_sql_int(row.get(3)?)?,
        balance_after: from_sql_int(row.get(4)?)?,
        reason: row.get(5)?,
        service: row.get(6)?,
        nonce: row.get(7)?,
        request_id: row.get(8)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(9, e))?,
        created_at: UnixTimestamp::from_secs(from_sql_int(row.get(10)?)?),
    })
}

const BALANCE_COLUMNS: &str = "wallet, credits, last_synced_block, residual_wei, updated_at";
const LEDGER_COLUMNS: &str = "wallet, direction, amount, balance_before, balance_after, reason, \
     service, nonce, request_id, metadata, created_at";

fn load_balance(tx: &Transaction<'_>, wallet: &WalletKey) -> Result<Option<CreditBalance>, StoreError> {
    Ok(tx
        .query_row(
            &format!("SELECT {BALANCE_COLUMNS} FROM credit_balances WHERE wallet = ?1"),
            params![wallet.as_str()],
            balance_from_row,
        )
        .optional()?)
}

fn ensure_row(tx: &Transaction<'_>, wallet: &WalletKey, now: UnixTimestamp) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR IGNORE INTO credit_balances (wallet, credits, residual_wei, updated_at) \
         VALUES (?1, 0, '0', ?2)",
        params![wallet.as_str(), to_sql_int(now.as_secs())?],
    )?;
    Ok(())
}

fn write_credits(
    tx: &Transaction<'_>,
    wallet: &WalletKey,
    credits: u64,
    now: UnixTimestamp,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE credit_balances SET credits = ?1, updated_at = ?2 WHERE wallet = ?3",
        params![to_sql_int(credits)?, to_sql_int(now.as_secs())?, wallet.as_str()],
    )?;
    Ok(())
}

fn append_ledger(
    tx: &Transaction<'_>,
    options: StoreOptions,
    entry: LedgerEntry,
) -> Result<(), StoreError> {
    let Some(entry) = options.ledger.admit(entry) else {
        return Ok(());
    };
    let metadata = serde_json::to_string(&entry.metadata)
        .map_err(|e| StoreError::Backend(format!("ledger metadata: {e}")))?;
    tx.execute(
        &format!(
            "INSERT INTO credit_ledger ({LEDGER_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            entry.wallet.as_str(),
            entry.direction.as_str(),
            entry.amount,
            to_sql_int(entry.balance_before)?,
            to_sql_int(entry.balance_after)?,
            entry.reason,
            entry.service,
            entry.nonce,
            entry.request_id,
            metadata,
            to_sql_int(entry.created_at.as_secs())?,
        ],
    )?;
    Ok(())
}

/// Inserts a nonce row. Returns `false` if the tuple already exists.
fn insert_nonce(
    tx: &Transaction<'_>,
    guard: NonceGuard,
    claim: &NonceClaim,
    now: UnixTimestamp,
) -> Result<bool, StoreError> {
    if guard == NonceGuard::BestEffort {
        let seen = tx
            .query_row(
                "SELECT 1 FROM access_nonces WHERE signer = ?1 AND service = ?2 AND nonce = ?3",
                params![claim.signer.as_str(), claim.service, claim.nonce],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if seen {
            return Ok(false);
        }
    }
    let inserted = tx.execute(
        "INSERT INTO access_nonces (signer, service, nonce, payload_timestamp, signature, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            claim.signer.as_str(),
            claim.service,
            claim.nonce,
            to_sql_int(claim.payload_timestamp.as_secs())?,
            claim.signature,
            to_sql_int(now.as_secs())?,
        ],
    );
    match inserted {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn replay_of(claim: &NonceClaim) -> StoreError {
    StoreError::ReplayDetected {
        signer: claim.signer.clone(),
        service: claim.service.clone(),
        nonce: claim.nonce.clone(),
    }
}

#[async_trait]
impl CreditStore for SqliteCreditStore {
    async fn balance(&self, wallet: &WalletKey) -> Result<Option<CreditBalance>, StoreError> {
        let wallet = wallet.clone();
        self.run(move |conn, _| {
            let tx = conn.transaction()?;
            load_balance(&tx, &wallet)
        })
        .await
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
        let wallet = wallet.clone();
        self.run(move |conn, options| {
            let now = UnixTimestamp::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let claim = context.nonce.filter(|_| options.nonces.records());
            if let Some(claim) = &claim
                && !insert_nonce(&tx, options.nonces, claim, now)?
            {
                return Err(replay_of(claim));
            }

            let after: Option<i64> = tx
                .query_row(
                    "UPDATE credit_balances SET credits = credits - ?1, updated_at = ?2 \
                     WHERE wallet = ?3 AND credits >= ?1 RETURNING credits",
                    params![to_sql_int(cost)?, to_sql_int(now.as_secs())?, wallet.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(after) = after else {
                let balance = load_balance(&tx, &wallet)?.map_or(0, |b| b.credits);
                return Err(StoreError::InsufficientCredits {
                    balance,
                    required: cost,
                });
            };
            let after = from_sql_int(after)?;
            let before = after + cost;

            let nonce_accepted = claim.is_some();
            append_ledger(
                &tx,
                options,
                LedgerEntry {
                    wallet: wallet.clone(),
                    direction: LedgerDirection::Debit,
                    amount: to_sql_int(cost)?,
                    balance_before: before,
                    balance_after: after,
                    reason: context.reason,
                    service: context.service,
                    nonce: claim.map(|c| c.nonce),
                    request_id: context.request_id,
                    metadata: context.metadata,
                    created_at: now,
                },
            )?;
            tx.commit()?;
            Ok(DebitReceipt {
                before,
                after,
                nonce_accepted,
            })
        })
        .await
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
        let wallet = wallet.clone();
        let reason = reason.to_owned();
        self.run(move |conn, options| {
            let now = UnixTimestamp::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_row(&tx, &wallet, now)?;
            let before = load_balance(&tx, &wallet)?.map_or(0, |b| b.credits);
            let after = credits::checked_add(before, amount)?;
            write_credits(&tx, &wallet, after, now)?;
            append_ledger(
                &tx,
                options,
                LedgerEntry {
                    wallet: wallet.clone(),
                    direction: LedgerDirection::Credit,
                    amount: to_sql_int(amount)?,
                    balance_before: before,
                    balance_after: after,
                    reason,
                    service: None,
                    nonce: None,
                    request_id: None,
                    metadata: serde_json::Value::Null,
                    created_at: now,
                },
            )?;
            tx.commit()?;
            Ok(BalanceChange { before, after })
        })
        .await
    }

    async fn set_balance(
        &self,
        wallet: &WalletKey,
        credits: u64,
        reason: &str,
    ) -> Result<BalanceChange, StoreError> {
        let after = credits::ensure_in_range("set_balance", credits)?;
        let wallet = wallet.clone();
        let reason = reason.to_owned();
        self.run(move |conn, options| {
            let now = UnixTimestamp::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_row(&tx, &wallet, now)?;
            let before = load_balance(&tx, &wallet)?.map_or(0, |b| b.credits);
            write_credits(&tx, &wallet, after, now)?;
            if before != after {
                append_ledger(
                    &tx,
                    options,
                    LedgerEntry {
                        wallet: wallet.clone(),
                        direction: LedgerDirection::Adjustment,
                        amount: adjustment_delta(before, after),
                        balance_before: before,
                        balance_after: after,
                        reason,
                        service: None,
                        nonce: None,
                        request_id: None,
                        metadata: serde_json::Value::Null,
                        created_at: now,
                    },
                )?;
            }
            tx.commit()?;
            Ok(BalanceChange { before, after })
        })
        .await
    }

    async fn try_accept_nonce(&self, claim: NonceClaim) -> Result<bool, StoreError> {
        if !self.options.nonces.records() {
            return Ok(true);
        }
        self.run(move |conn, options| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let accepted = insert_nonce(&tx, options.nonces, &claim, UnixTimestamp::now())?;
            tx.commit()?;
            Ok(accepted)
        })
        .await
    }

    async fn apply_sync(&self, commit: SyncCommit) -> Result<SyncApplied, StoreError> {
        self.run(move |conn, options| {
            let now = UnixTimestamp::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = load_balance(&tx, &commit.wallet)?;
            let actual = current.as_ref().and_then(|b| b.last_synced_block);
            if actual != commit.expected_cursor {
                return Err(StoreError::CursorConflict {
                    expected: commit.expected_cursor,
                    actual,
                });
            }
            let before = current.map_or(0, |b| b.credits);
            let after = credits::checked_add(before, commit.added_credits)?;
            let cursor = actual.map_or(commit.scanned_to_block, |c| c.max(commit.scanned_to_block));

            ensure_row(&tx, &commit.wallet, now)?;
            tx.execute(
                "UPDATE credit_balances \
                 SET credits = ?1, residual_wei = ?2, last_synced_block = ?3, updated_at = ?4 \
                 WHERE wallet = ?5",
                params![
                    to_sql_int(after)?,
                    commit.residual_wei.to_string(),
                    to_sql_int(cursor)?,
                    to_sql_int(now.as_secs())?,
                    commit.wallet.as_str(),
                ],
            )?;
            if commit.added_credits > 0 {
                append_ledger(
                    &tx,
                    options,
                    LedgerEntry {
                        wallet: commit.wallet.clone(),
                        direction: LedgerDirection::Credit,
                        amount: to_sql_int(commit.added_credits)?,
                        balance_before: before,
                        balance_after: after,
                        reason: "deposit-sync".into(),
                        service: None,
                        nonce: None,
                        request_id: None,
                        metadata: sync_metadata(&commit),
                        created_at: now,
                    },
                )?;
            }
            let balance = load_balance(&tx, &commit.wallet)?
                .ok_or_else(|| StoreError::Backend("balance row vanished during sync".into()))?;
            tx.commit()?;
            Ok(SyncApplied {
                balance,
                added_credits: commit.added_credits,
            })
        })
        .await
    }

    async fn pricing(&self, service: &str) -> Result<Option<ServicePricing>, StoreError> {
        let service = service.to_owned();
        self.run(move |conn, _| {
            Ok(conn
                .query_row(
                    "SELECT service, cost, is_active FROM service_pricing WHERE service = ?1",
                    params![service],
                    |row| {
                        Ok(ServicePricing {
                            service: row.get(0)?,
                            cost: from_sql_int(row.get(1)?)?,
                            is_active: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn upsert_pricing(&self, pricing: ServicePricing) -> Result<(), StoreError> {
        if pricing.cost == 0 || pricing.cost > MAX_CREDITS {
            return Err(StoreError::InvalidAmount("pricing cost"));
        }
        self.run(move |conn, _| {
            conn.execute(
                "INSERT INTO service_pricing (service, cost, is_active) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(service) DO UPDATE SET cost = excluded.cost, is_active = excluded.is_active",
                params![pricing.service, to_sql_int(pricing.cost)?, pricing.is_active],
            )?;
            Ok(())
        })
        .await
    }

    async fn ledger_entries(
        &self,
        wallet: &WalletKey,
        since: Option<UnixTimestamp>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let wallet = wallet.clone();
        let since = to_sql_int(since.map_or(0, |s| s.as_secs()))?;
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LEDGER_COLUMNS} FROM credit_ledger \
                 WHERE wallet = ?1 AND created_at >= ?2 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![wallet.as_str(), since], ledger_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn wallets(&self) -> Result<Vec<CreditBalance>, StoreError> {
        self.run(|conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BALANCE_COLUMNS} FROM credit_balances ORDER BY wallet"
            ))?;
            let rows = stmt.query_map([], balance_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn record_replay(&self, attempt: ReplayAttempt) -> Result<(), StoreError> {
        self.run(move |conn, _| {
            conn.execute(
                "INSERT INTO replay_attempts (signer, service, nonce, observed_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    attempt.signer.as_str(),
                    attempt.service,
                    attempt.nonce,
                    to_sql_int(attempt.observed_at.as_secs())?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn replay_attempts_since(
        &self,
        since: UnixTimestamp,
    ) -> Result<Vec<ReplayAttempt>, StoreError> {
        let since = to_sql_int(since.as_secs())?;
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(
                "SELECT signer, service, nonce, observed_at FROM replay_attempts \
                 WHERE observed_at >= ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                let signer: String = row.get(0)?;
                Ok(ReplayAttempt {
                    signer: signer.parse().map_err(|e| conversion_error(0, e))?,
                    service: row.get(1)?,
                    nonce: row.get(2)?,
                    observed_at: UnixTimestamp::from_secs(from_sql_int(row.get(3)?)?),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

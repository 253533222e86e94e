//! Adaptive, resumable deposit log scanning.
//!
//! Providers cap the block span of a log query, and the cap differs per
//! provider and sometimes per request. [`DepositScanner`] walks the range
//! after a wallet's cursor in sub-chunks driven by [`ChunkWalker`]: on a range
//! rejection it shrinks to the window the provider suggests (or halves),
//! never below a floor, and retries the same sub-range. The walk is bounded by
//! a per-invocation span and an overall time budget; hitting either yields a
//! partial scan that the next invocation resumes from the stored cursor.

use std::sync::LazyLock;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use ghostgate::WalletKey;
use ghostgate::sync::{DepositScan, DepositSource, ScanError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout};

static HEX_WINDOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(0x[0-9a-fA-F]+)\s*,\s*(0x[0-9a-fA-F]+)\s*\]").expect("valid window regex")
});

static MAX_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:max(?:imum)?\s+(?:block\s+)?range|block\s+range\s+limit)\D{0,20}?(\d+)")
        .expect("valid range regex")
});

const RANGE_HINTS: [&str; 7] = [
    "block range",
    "range limit",
    "range is too large",
    "exceed",
    "too many",
    "query returned more than",
    "limit exceeded",
];

/// Extracts a block span the provider says it would accept.
///
/// Understands a suggested `[0xFROM, 0xTO]` window and a stated
/// "maximum block range N".
#[must_use]
pub fn suggested_span(message: &str) -> Option<u64> {
    if let Some(caps) = HEX_WINDOW.captures(message) {
        let from = u64::from_str_radix(caps[1].trim_start_matches("0x"), 16).ok()?;
        let to = u64::from_str_radix(caps[2].trim_start_matches("0x"), 16).ok()?;
        return to.checked_sub(from).map(|d| d + 1).filter(|span| *span > 0);
    }
    MAX_RANGE
        .captures(message)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .filter(|span| *span > 0)
}

/// Failure of a single log query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogQueryError {
    /// The provider refused the block span.
    #[error("block range rejected: {message}")]
    RangeRejected {
        /// Provider message.
        message: String,
        /// Span the provider would accept, if it said so.
        suggested_span: Option<u64>,
    },
    /// Any other failure.
    #[error("log query failed: {0}")]
    Transport(String),
}

impl LogQueryError {
    /// Classifies a provider error message.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let suggested = suggested_span(&message);
        let lower = message.to_lowercase();
        if suggested.is_some() || RANGE_HINTS.iter().any(|hint| lower.contains(hint)) {
            Self::RangeRejected {
                message,
                suggested_span: suggested,
            }
        } else {
            Self::Transport(message)
        }
    }
}

/// One `eth_getLogs`-style query for deposits by one payer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositQuery {
    /// Beneficiary filter, if configured.
    pub agent: Option<Address>,
    /// Payer whose deposits are wanted.
    pub payer: Address,
    /// First block, inclusive.
    pub from_block: u64,
    /// Last block, inclusive.
    pub to_block: u64,
}

/// A decoded deposit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositLog {
    /// Block containing the event.
    pub block_number: u64,
    /// Deposited wei.
    pub amount: U256,
}

/// Chain access needed by the scanner.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Latest block number.
    async fn head_block(&self) -> Result<u64, LogQueryError>;

    /// Deposit events matching `query`.
    async fn deposits(&self, query: &DepositQuery) -> Result<Vec<DepositLog>, LogQueryError>;
}

/// Sub-chunk state of one scan: next block, current chunk size, floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWalker {
    cursor: u64,
    end: u64,
    chunk: u64,
    floor: u64,
}

impl ChunkWalker {
    /// Walks `[start, end]` starting with `initial_chunk`-block queries.
    #[must_use]
    pub fn new(start: u64, end: u64, initial_chunk: u64, min_chunk: u64) -> Self {
        let floor = min_chunk.max(1);
        Self {
            cursor: start,
            end,
            chunk: initial_chunk.max(floor),
            floor,
        }
    }

    /// Next block to scan.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Current chunk size.
    #[must_use]
    pub const fn chunk(&self) -> u64 {
        self.chunk
    }

    /// The next inclusive sub-range, or `None` once `end` is covered.
    #[must_use]
    pub fn next_range(&self) -> Option<(u64, u64)> {
        (self.cursor <= self.end).then(|| {
            let to = self.cursor.saturating_add(self.chunk - 1).min(self.end);
            (self.cursor, to)
        })
    }

    /// Marks everything up to `to` as scanned.
    pub const fn advance(&mut self, to: u64) {
        self.cursor = to.saturating_add(1);
    }

    /// Shrinks the chunk after a rejection.
    ///
    /// Uses `suggested` when it is smaller than the current chunk, otherwise
    /// halves; never goes below the floor. Returns `false` if the chunk is
    /// already at the floor.
    pub fn shrink(&mut self, suggested: Option<u64>) -> bool {
        if self.chunk <= self.floor {
            return false;
        }
        let next = match suggested {
            Some(span) if span < self.chunk => span,
            _ => self.chunk / 2,
        };
        self.chunk = next.max(self.floor);
        true
    }
}

/// Scanner tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerConfig {
    /// Block the ledger contract was deployed at; scanning never starts earlier.
    #[serde(default)]
    pub deployment_block: u64,
    /// Beneficiary filter (the `agent` topic).
    #[serde(default)]
    pub agent: Option<Address>,
    /// Span covered by one invocation at most.
    #[serde(default = "defaults::max_blocks_per_sync")]
    pub max_blocks_per_sync: u64,
    /// First sub-chunk size.
    #[serde(default = "defaults::initial_chunk")]
    pub initial_chunk: u64,
    /// Smallest sub-chunk size.
    #[serde(default = "defaults::min_chunk")]
    pub min_chunk: u64,
    /// Timeout of each provider call, in seconds.
    #[serde(default = "defaults::call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Wall-clock budget of one invocation, in seconds.
    #[serde(default = "defaults::time_budget_secs")]
    pub time_budget_secs: u64,
}

mod defaults {
    pub const fn max_blocks_per_sync() -> u64 {
        50_000
    }
    pub const fn initial_chunk() -> u64 {
        5_000
    }
    pub const fn min_chunk() -> u64 {
        100
    }
    pub const fn call_timeout_secs() -> u64 {
        10
    }
    pub const fn time_budget_secs() -> u64 {
        25
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            deployment_block: 0,
            agent: None,
            max_blocks_per_sync: defaults::max_blocks_per_sync(),
            initial_chunk: defaults::initial_chunk(),
            min_chunk: defaults::min_chunk(),
            call_timeout_secs: defaults::call_timeout_secs(),
            time_budget_secs: defaults::time_budget_secs(),
        }
    }
}

/// Scans deposit logs for a payer through a [`LogSource`].
#[derive(Debug, Clone)]
pub struct DepositScanner<L> {
    logs: L,
    config: ScannerConfig,
}

impl<L: LogSource> DepositScanner<L> {
    /// Creates a scanner.
    pub const fn new(logs: L, config: ScannerConfig) -> Self {
        Self { logs, config }
    }

    /// The scanner configuration.
    pub const fn config(&self) -> &ScannerConfig {
        &self.config
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.call_timeout_secs)
    }

    async fn head_block(&self) -> Result<u64, ScanError> {
        match timeout(self.call_timeout(), self.logs.head_block()).await {
            Ok(Ok(head)) => Ok(head),
            Ok(Err(e)) => Err(ScanError::Provider(e.to_string())),
            Err(_) => Err(ScanError::Timeout(self.call_timeout())),
        }
    }
}

#[async_trait]
impl<L: LogSource> DepositSource for DepositScanner<L> {
    async fn scan(&self, payer: &WalletKey, cursor: Option<u64>) -> Result<DepositScan, ScanError> {
        let head = self.head_block().await?;
        let start = cursor
            .map_or(0, |c| c.saturating_add(1))
            .max(self.config.deployment_block);
        if start > head {
            return Ok(DepositScan {
                from_block: start,
                to_block: start - 1,
                head_block: head,
                matched_deposits: 0,
                deposited_wei: U256::ZERO,
                partial_sync: false,
                next_from_block: start,
            });
        }
        let span = self.config.max_blocks_per_sync.max(1);
        let end = head.min(start.saturating_add(span - 1));
        let mut walker = ChunkWalker::new(start, end, self.config.initial_chunk, self.config.min_chunk);
        let deadline = Instant::now() + Duration::from_secs(self.config.time_budget_secs);
        let call_timeout = self.call_timeout();
        let payer = payer.address();

        let mut matched = 0_u64;
        let mut deposited = U256::ZERO;
        while let Some((from, to)) = walker.next_range() {
            if walker.cursor() > start && Instant::now() >= deadline {
                #[cfg(feature = "telemetry")]
                tracing::info!(payer = %payer, scanned_to = walker.cursor() - 1, "scan time budget exhausted");
                break;
            }
            let query = DepositQuery {
                agent: self.config.agent,
                payer,
                from_block: from,
                to_block: to,
            };
            match timeout(call_timeout, self.logs.deposits(&query)).await {
                Ok(Ok(logs)) => {
                    matched += logs.len() as u64;
                    deposited = logs
                        .iter()
                        .fold(deposited, |acc, log| acc.saturating_add(log.amount));
                    walker.advance(to);
                }
                Ok(Err(LogQueryError::RangeRejected {
                    message,
                    suggested_span,
                })) => {
                    if !walker.shrink(suggested_span) {
                        return Err(ScanError::RangeFloor {
                            from,
                            to,
                            detail: message,
                        });
                    }
                    #[cfg(feature = "telemetry")]
                    tracing::debug!(from, to, chunk = walker.chunk(), "log range rejected, shrinking");
                }
                Ok(Err(LogQueryError::Transport(message))) => {
                    return Err(ScanError::Provider(message));
                }
                Err(_) => {
                    if !walker.shrink(None) {
                        return Err(ScanError::Timeout(call_timeout));
                    }
                    #[cfg(feature = "telemetry")]
                    tracing::debug!(from, to, chunk = walker.chunk(), "log query timed out, shrinking");
                }
            }
        }

        let to_block = walker.cursor() - 1;
        Ok(DepositScan {
            from_block: start,
            to_block,
            head_block: head,
            matched_deposits: matched,
            deposited_wei: deposited,
            partial_sync: to_block < head,
            next_from_block: walker.cursor(),
        })
    }
}

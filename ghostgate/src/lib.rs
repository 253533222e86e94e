#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core of the GhostGate credit gate.
//!
//! Callers prepay by depositing ETH into a ledger contract; an off-chain
//! synchronizer folds those deposits into a per-wallet credit balance, and
//! every protected request spends credits after proving its signer with a
//! short-lived signed message.
//!
//! This crate is chain- and transport-agnostic. Signature recovery and the
//! deposit log source are traits implemented in `ghostgate-evm`; the HTTP
//! surface lives in `ghostgate-http`.
//!
//! # Modules
//!
//! - [`access`] - Signed access payloads, freshness guard and signer/verifier seams
//! - [`credits`] - Range-checked credit arithmetic and wei conversion
//! - [`gate`] - The authorization state machine
//! - [`ledger`] - Balance rows, audit entries and mutation receipts
//! - [`monitor`] - Ledger reconciliation and replay spike detection
//! - [`nonce`] - Replay protection records and guard strategies
//! - [`pricing`] - Per-request cost resolution
//! - [`store`] - The [`CreditStore`](store::CreditStore) seam and its backends
//! - [`sync`] - Deposit-to-credit synchronization
//!
//! # Feature Flags
//!
//! - `sqlite` - Durable `SqliteCreditStore` backed by `rusqlite`
//! - `telemetry` - Enables tracing instrumentation

pub mod access;
pub mod credits;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod monitor;
pub mod nonce;
pub mod pricing;
pub mod store;
pub mod sync;
pub mod timestamp;
pub mod wallet;

pub use error::GateError;
pub use timestamp::UnixTimestamp;
pub use wallet::WalletKey;

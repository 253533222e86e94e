#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EVM support for GhostGate.
//!
//! - [`access`] - The EIP-712 `Access` message and its signing domain
//! - [`verifier`] - [`Eip712Verifier`], recovering access payload signers
//! - [`contract`] - Credit ledger contract event bindings
//! - [`scanner`] - Adaptive deposit log scanning behind the [`LogSource`](scanner::LogSource) seam
//! - `signer` - Client-side payload signing (feature `client`)
//! - `provider` - alloy-backed [`LogSource`](scanner::LogSource) (feature `provider`)
//!
//! # Feature Flags
//!
//! - `client` - [`LocalAccessSigner`] for callers of protected endpoints
//! - `provider` - JSON-RPC log source with throttled fallback transports
//! - `telemetry` - Enables tracing instrumentation

pub mod access;
pub mod contract;
pub mod scanner;
pub mod verifier;

#[cfg(feature = "provider")]
pub mod provider;
#[cfg(feature = "client")]
pub mod signer;

pub use access::DEFAULT_CHAIN_ID;
pub use scanner::{DepositScanner, ScannerConfig};
#[cfg(feature = "client")]
pub use signer::LocalAccessSigner;
pub use verifier::Eip712Verifier;

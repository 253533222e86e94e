//! The EIP-712 `Access` message.
//!
//! Signed with domain `{name: "GhostGate", version: "1", chainId}` and primary
//! type `Access(string service,uint256 timestamp,string nonce)`.

use alloy_primitives::{B256, U256};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain, sol};
use ghostgate::access::AccessPayload;

/// Base mainnet.
pub const DEFAULT_CHAIN_ID: u64 = 8453;

/// EIP-712 domain name.
pub const DOMAIN_NAME: &str = "GhostGate";

/// EIP-712 domain version.
pub const DOMAIN_VERSION: &str = "1";

sol!(
    /// Typed access message signed by callers.
    ///
    /// Field order and types define the type hash and must not change.
    #[derive(Debug, PartialEq, Eq)]
    struct Access {
        string service;
        uint256 timestamp;
        string nonce;
    }
);

impl From<&AccessPayload> for Access {
    fn from(payload: &AccessPayload) -> Self {
        Self {
            service: payload.service.clone(),
            timestamp: U256::from(payload.timestamp.as_secs()),
            nonce: payload.nonce.clone(),
        }
    }
}

/// The signing domain for `chain_id`.
#[must_use]
pub fn access_domain(chain_id: u64) -> Eip712Domain {
    eip712_domain! {
        name: DOMAIN_NAME,
        version: DOMAIN_VERSION,
        chain_id: chain_id,
    }
}

/// The digest a caller signs for `payload`.
#[must_use]
pub fn access_signing_hash(payload: &AccessPayload, chain_id: u64) -> B256 {
    Access::from(payload).eip712_signing_hash(&access_domain(chain_id))
}

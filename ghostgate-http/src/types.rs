//! Request and response bodies shared by the server routes and the client.

use ghostgate::WalletKey;
use ghostgate::ledger::CreditBalance;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Wallet whose deposits should be folded in.
    pub wallet: WalletKey,
}

/// Body of `GET /api/credits/{wallet}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsView {
    /// Canonical wallet key.
    pub wallet: WalletKey,
    /// Spendable credits.
    pub credits: u64,
    /// Sync cursor, `null` before the first sync.
    pub last_synced_block: Option<u64>,
    /// Unconverted deposit remainder as a decimal string.
    pub residual_wei: String,
    /// Unix seconds of the last mutation, `null` for unknown wallets.
    pub updated_at: Option<u64>,
}

impl CreditsView {
    /// View of a wallet that has never been credited.
    #[must_use]
    pub fn empty(wallet: WalletKey) -> Self {
        Self {
            wallet,
            credits: 0,
            last_synced_block: None,
            residual_wei: "0".to_owned(),
            updated_at: None,
        }
    }
}

impl From<CreditBalance> for CreditsView {
    fn from(balance: CreditBalance) -> Self {
        Self {
            wallet: balance.wallet,
            credits: balance.credits,
            last_synced_block: balance.last_synced_block,
            residual_wei: balance.residual_wei.to_string(),
            updated_at: Some(balance.updated_at.as_secs()),
        }
    }
}

//! [`LogSource`] over an alloy JSON-RPC provider.
//!
//! The RPC client fans out over every configured HTTP endpoint with per
//! endpoint rate limits: each transport is wrapped in a [`ThrottleLayer`]
//! and the set is combined with a [`FallbackLayer`].

use std::num::NonZeroUsize;

use alloy_primitives::Address;
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::Filter;
use alloy_sol_types::SolEvent;
use alloy_transport::layers::{FallbackLayer, ThrottleLayer};
use alloy_transport_http::Http;
use async_trait::async_trait;
use tower::ServiceBuilder;
use url::Url;

use crate::contract::ICreditLedger::Deposited;
use crate::scanner::{DepositLog, DepositQuery, LogQueryError, LogSource};

/// An RPC endpoint and its optional requests-per-second limit.
pub type RpcEndpoint = (Url, Option<u32>);

/// No usable HTTP endpoint was configured.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("at least one http(s) rpc endpoint is required")]
pub struct NoRpcEndpoints;

/// Builds a throttled, fallback-enabled RPC client.
///
/// Non-HTTP(S) URLs are skipped.
///
/// # Errors
///
/// Returns [`NoRpcEndpoints`] if no HTTP endpoint remains.
pub fn rpc_client(endpoints: &[RpcEndpoint]) -> Result<RpcClient, NoRpcEndpoints> {
    let transports = endpoints
        .iter()
        .filter(|(url, _)| matches!(url.scheme(), "http" | "https"))
        .map(|(url, rate_limit)| {
            #[cfg(feature = "telemetry")]
            tracing::info!(rpc_url = %url, rate_limit = ?rate_limit, "using http transport");
            ServiceBuilder::new()
                .layer(ThrottleLayer::new(rate_limit.unwrap_or(u32::MAX)))
                .service(Http::new(url.clone()))
        })
        .collect::<Vec<_>>();
    let count = NonZeroUsize::new(transports.len()).ok_or(NoRpcEndpoints)?;
    let fallback = ServiceBuilder::new()
        .layer(FallbackLayer::default().with_active_transport_count(count))
        .service(transports);
    Ok(RpcClient::new(fallback, false))
}

/// Reads `Deposited` events of one ledger contract.
#[derive(Debug, Clone)]
pub struct AlloyLogSource<P> {
    provider: P,
    contract: Address,
}

impl AlloyLogSource<RootProvider> {
    /// Connects to `endpoints`.
    ///
    /// # Errors
    ///
    /// Returns [`NoRpcEndpoints`] if no HTTP endpoint is configured.
    pub fn connect(endpoints: &[RpcEndpoint], contract: Address) -> Result<Self, NoRpcEndpoints> {
        Ok(Self::new(RootProvider::new(rpc_client(endpoints)?), contract))
    }
}

impl<P: Provider> AlloyLogSource<P> {
    /// Wraps an existing provider.
    pub const fn new(provider: P, contract: Address) -> Self {
        Self { provider, contract }
    }

    fn filter(&self, query: &DepositQuery) -> Filter {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(Deposited::SIGNATURE_HASH)
            .topic2(query.payer.into_word())
            .from_block(query.from_block)
            .to_block(query.to_block);
        match query.agent {
            Some(agent) => filter.topic1(agent.into_word()),
            None => filter,
        }
    }
}

#[async_trait]
impl<P: Provider> LogSource for AlloyLogSource<P> {
    async fn head_block(&self) -> Result<u64, LogQueryError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| LogQueryError::Transport(e.to_string()))
    }

    async fn deposits(&self, query: &DepositQuery) -> Result<Vec<DepositLog>, LogQueryError> {
        let logs = self
            .provider
            .get_logs(&self.filter(query))
            .await
            .map_err(|e| LogQueryError::from_message(e.to_string()))?;
        logs.iter()
            .filter(|log| !log.removed)
            .map(|log| {
                let event = Deposited::decode_log_data(log.data())
                    .map_err(|e| LogQueryError::Transport(format!("undecodable deposit log: {e}")))?;
                Ok(DepositLog {
                    block_number: log.block_number.unwrap_or(query.from_block),
                    amount: event.amount,
                })
            })
            .collect()
    }
}

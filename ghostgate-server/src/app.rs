//! Wiring of configuration into the store, gate, synchronizer and router.

use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use ghostgate::gate::GateAuthorizer;
use ghostgate::store::{CreditStore, InMemoryCreditStore, SqliteCreditStore, StoreError};
use ghostgate::sync::CreditSynchronizer;
use ghostgate_evm::provider::AlloyLogSource;
use ghostgate_evm::{DepositScanner, Eip712Verifier};
use ghostgate_http::AppState;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

/// Error type of the binary's top level.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opens the configured store: SQLite when `database` is set, memory otherwise.
///
/// # Errors
///
/// Returns [`StoreError`] if the database cannot be opened or migrated.
pub fn open_store(config: &ServerConfig) -> Result<Arc<dyn CreditStore>, StoreError> {
    if let Some(path) = &config.database {
        tracing::info!(path = %path.display(), "opening sqlite credit store");
        Ok(Arc::new(SqliteCreditStore::open(path, config.store)?))
    } else {
        tracing::warn!("no database configured, balances live in memory only");
        Ok(Arc::new(InMemoryCreditStore::new(config.store)))
    }
}

/// The gate for `store` with an EIP-712 verifier on the configured chain.
#[must_use]
pub fn gate(config: &ServerConfig, store: Arc<dyn CreditStore>) -> GateAuthorizer {
    GateAuthorizer::new(
        store,
        Arc::new(Eip712Verifier::new(config.chain_id)),
        config.gate,
    )
}

/// The deposit synchronizer, or `None` when no chain is configured.
///
/// # Errors
///
/// Fails on malformed RPC URLs, when no HTTP endpoint remains, or on an
/// invalid credit price.
pub fn synchronizer(
    config: &ServerConfig,
    store: Arc<dyn CreditStore>,
) -> Result<Option<CreditSynchronizer>, BoxError> {
    let Some(chain) = &config.chain else {
        tracing::warn!("no chain configured, deposit sync is disabled");
        return Ok(None);
    };
    let logs = AlloyLogSource::connect(&chain.endpoints()?, chain.contract)?;
    tracing::info!(
        contract = %chain.contract,
        deployment_block = config.scanner.deployment_block,
        "deposit sync enabled"
    );
    let scanner = DepositScanner::new(logs, config.scanner);
    Ok(Some(CreditSynchronizer::new(
        store,
        Arc::new(scanner),
        config.credit_price()?,
    )?))
}

/// The public router with tracing and permissive CORS.
pub fn router(state: AppState) -> Router {
    ghostgate_http::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        )
}

//! GhostGate credit gate server.
//!
//! # Usage
//!
//! ```bash
//! # Serve with config.toml in the current directory
//! cargo run -p ghostgate-server --release
//!
//! # Custom config path
//! CONFIG=/path/to/config.toml cargo run -p ghostgate-server
//!
//! # Operator commands
//! ghostgate-server set-balance 0xabc... 500 --reason "support refund"
//! ghostgate-server set-pricing weather 3
//! ghostgate-server reconcile
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `config.toml`)
//! - `HOST` - Override bind address (default: `0.0.0.0`)
//! - `PORT` - Override port (default: `4021`)
//! - `GHOST_GATE_DEFAULT_COST` - Default credits per request
//! - `RUST_LOG` - Log level filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ghostgate::WalletKey;
use ghostgate::access::normalize_service;
use ghostgate::monitor::LedgerReconciler;
use ghostgate::pricing::ServicePricing;
use ghostgate::store::CreditStore;
use ghostgate_http::AppState;
use tracing_subscriber::EnvFilter;

use ghostgate_server::app::{self, BoxError};
use ghostgate_server::config::ServerConfig;
use ghostgate_server::jobs;
use ghostgate_server::shutdown::Shutdown;

#[derive(Debug, Parser)]
#[command(name = "ghostgate-server", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API and run background jobs (default).
    Serve,
    /// Overwrite a wallet's balance, journaled as an adjustment.
    SetBalance {
        /// Wallet address.
        wallet: WalletKey,
        /// New balance in credits.
        credits: u64,
        /// Ledger reason.
        #[arg(long, default_value = "manual adjustment")]
        reason: String,
    },
    /// Create or replace the price of a service.
    SetPricing {
        /// Service slug.
        service: String,
        /// Credits per request.
        cost: u64,
        /// Store the row as inactive.
        #[arg(long)]
        inactive: bool,
    },
    /// Compare balances against the ledger and exit non-zero on drift.
    Reconcile,
    /// Run one deposit sync pass for a wallet.
    Sync {
        /// Wallet address.
        wallet: WalletKey,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!("ghostgate-server failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = ServerConfig::load(cli.config.as_deref())?;
    let store = app::open_store(&config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store).await,
        Command::SetBalance {
            wallet,
            credits,
            reason,
        } => {
            let change = store.set_balance(&wallet, credits, &reason).await?;
            tracing::info!(%wallet, before = change.before, after = change.after, "balance set");
            Ok(())
        }
        Command::SetPricing {
            service,
            cost,
            inactive,
        } => {
            let pricing = ServicePricing {
                service: normalize_service(&service).to_owned(),
                cost,
                is_active: !inactive,
            };
            store.upsert_pricing(pricing.clone()).await?;
            tracing::info!(service = %pricing.service, cost, active = pricing.is_active, "pricing saved");
            Ok(())
        }
        Command::Reconcile => {
            let report = LedgerReconciler::new(store).reconcile().await?;
            tracing::info!(report = %serde_json::to_string(&report)?, "reconciliation finished");
            if report.is_clean() {
                Ok(())
            } else {
                Err(format!("{} wallet(s) drifted from the ledger", report.drifts.len()).into())
            }
        }
        Command::Sync { wallet } => {
            let sync = app::synchronizer(&config, store)?.ok_or("no chain configured")?;
            let outcome = sync.sync_wallet(&wallet).await?;
            tracing::info!(outcome = %serde_json::to_string(&outcome)?, "sync finished");
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig, store: Arc<dyn CreditStore>) -> Result<(), BoxError> {
    tracing::info!(
        host = %config.host,
        port = config.port,
        chain_id = config.chain_id,
        replay_window_secs = config.gate.replay_window_secs,
        "Loaded configuration"
    );

    let shutdown = Shutdown::install()?;
    let sync = app::synchronizer(&config, Arc::clone(&store))?;
    let mut state = AppState::new(app::gate(&config, Arc::clone(&store)));
    if let Some(sync) = &sync {
        state = state.with_sync(sync.clone());
    }

    jobs::spawn(
        shutdown.tasks(),
        &shutdown.token(),
        config.jobs,
        &store,
        sync.map(Arc::new),
        config.replay,
    );

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("GhostGate listening on http://{addr}");

    let token = shutdown.token();
    axum::serve(listener, app::router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    shutdown.drain().await;
    tracing::info!("GhostGate shut down gracefully");
    Ok(())
}

//! Server configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4021
//! database = "ghostgate.db"
//! chainId = 8453
//! creditPriceWei = "10000000000000"
//!
//! [gate]
//! replayWindowSecs = 60
//! cost = { clientCost = "ignore", defaultCost = 2 }
//!
//! [store]
//! ledger = "persistent"
//! nonces = "enforced"
//!
//! [chain]
//! contract = "0x0000000000000000000000000000000000000001"
//! rpc = [{ url = "$RPC_URL_BASE", rateLimit = 10 }]
//!
//! [scanner]
//! deploymentBlock = 12000000
//!
//! [jobs]
//! syncIntervalSecs = 300
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `config.toml`)
//! - `HOST` - Override server bind address
//! - `PORT` - Override server port
//! - `GHOST_GATE_DEFAULT_COST` - Override the default per-request cost
//! - RPC URLs and other secrets referenced by `$VAR` in the config file

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use alloy_primitives::{Address, U256};
use ghostgate::gate::GateConfig;
use ghostgate::monitor::ReplayThresholds;
use ghostgate::store::StoreOptions;
use ghostgate_evm::ScannerConfig;
use ghostgate_evm::provider::RpcEndpoint;
use serde::{Deserialize, Serialize};
use url::Url;

/// Environment variable overriding [`GateConfig`]'s default cost.
pub const DEFAULT_COST_ENV: &str = "GHOST_GATE_DEFAULT_COST";

/// Configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The TOML does not match the schema.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// An environment override is malformed.
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
    /// `creditPriceWei` is not a positive decimal integer.
    #[error("creditPriceWei must be a positive integer, got {0:?}")]
    InvalidCreditPrice(String),
    /// An RPC URL is malformed, usually an unresolved `$VAR`.
    #[error("invalid rpc url {url:?}: {source}")]
    InvalidRpcUrl {
        /// Raw URL.
        url: String,
        /// Parse error.
        source: url::ParseError,
    },
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4021`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path; omitted means an in-memory store.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// EIP-712 domain chain id (default: `8453`).
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Wei per credit as a decimal string.
    #[serde(default = "default_credit_price_wei")]
    pub credit_price_wei: String,

    /// Gate policy.
    #[serde(default)]
    pub gate: GateConfig,

    /// Store strategies.
    #[serde(default)]
    pub store: StoreOptions,

    /// Deposit source; sync is disabled without it.
    #[serde(default)]
    pub chain: Option<ChainConfig>,

    /// Deposit scanner tuning.
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Background job intervals.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Replay spike thresholds.
    #[serde(default)]
    pub replay: ReplayThresholds,
}

/// Ledger contract and the RPC endpoints used to read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// Ledger contract address.
    pub contract: Address,
    /// RPC endpoints, tried in order with fallback.
    pub rpc: Vec<RpcConfig>,
}

/// One RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    /// HTTP(S) URL. Supports `$VAR` / `${VAR}`.
    pub url: String,
    /// Requests per second.
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

/// Background job intervals in seconds; `0` disables a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobsConfig {
    /// Sync every known wallet.
    pub sync_interval_secs: u64,
    /// Check ledger consistency.
    pub reconcile_interval_secs: u64,
    /// Check for replay spikes.
    pub replay_check_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
            reconcile_interval_secs: 3600,
            replay_check_interval_secs: 60,
        }
    }
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4021
}

const fn default_chain_id() -> u64 {
    ghostgate_evm::DEFAULT_CHAIN_ID
}

fn default_credit_price_wei() -> String {
    "10000000000000".to_owned()
}

impl ServerConfig {
    /// Loads configuration from `path`, or from the `CONFIG` environment
    /// variable, falling back to `config.toml` in the current directory.
    ///
    /// After loading, all string values with `$VAR` / `${VAR}` references
    /// are expanded from the process environment. `HOST`, `PORT` and
    /// `GHOST_GATE_DEFAULT_COST` override the file values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(
            || PathBuf::from(std::env::var("CONFIG").unwrap_or_else(|_| "config.toml".to_owned())),
            Path::to_path_buf,
        );
        let content = if path.exists() {
            std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?
        } else {
            String::new()
        };
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parses TOML after expanding environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on schema mismatch.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&expand_env_vars(content))?)
    }

    fn apply_env_overrides(
        &mut self,
        env: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = env("HOST") {
            self.host = host
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name: "HOST", value: host })?;
        }
        if let Some(port) = env("PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name: "PORT", value: port })?;
        }
        if let Some(cost) = env(DEFAULT_COST_ENV) {
            let parsed = cost
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|c| *c > 0 && *c <= ghostgate::credits::MAX_CREDITS)
                .ok_or(ConfigError::InvalidEnv {
                    name: DEFAULT_COST_ENV,
                    value: cost,
                })?;
            self.gate.cost.default_cost = Some(parsed);
        }
        Ok(())
    }

    /// The parsed credit price.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCreditPrice`] for zero or non-decimal input.
    pub fn credit_price(&self) -> Result<U256, ConfigError> {
        U256::from_str_radix(self.credit_price_wei.trim(), 10)
            .ok()
            .filter(|price| !price.is_zero())
            .ok_or_else(|| ConfigError::InvalidCreditPrice(self.credit_price_wei.clone()))
    }
}

impl ChainConfig {
    /// Parsed RPC endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRpcUrl`] for the first malformed URL.
    pub fn endpoints(&self) -> Result<Vec<RpcEndpoint>, ConfigError> {
        self.rpc
            .iter()
            .map(|rpc| {
                let url = Url::parse(rpc.url.trim()).map_err(|source| ConfigError::InvalidRpcUrl {
                    url: rpc.url.clone(),
                    source,
                })?;
                Ok((url, rpc.rate_limit))
            })
            .collect()
    }
}

/// Expands `$VAR` and `${VAR}` patterns in a string from environment variables.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            var_name.push(c);
            chars.next();
        }

        if let Some(value) = (!var_name.is_empty()).then(|| lookup(&var_name)).flatten() {
            result.push_str(&value);
        } else {
            result.push('$');
            if braced {
                result.push('{');
            }
            result.push_str(&var_name);
            if braced && !var_name.is_empty() {
                result.push('}');
            }
        }
    }

    result
}

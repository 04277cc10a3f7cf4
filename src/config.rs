use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use config::ConfigError;

use crate::ledger::models::Chain;

pub const DEFAULT_MAX_WINDOW_SIZE: u64 = 2_000;

/// A currency accepted on a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    pub symbol: String,
    /// ERC-20 contract, `None` for the chain's native coin
    pub address: Option<Address>,
    pub decimals: u32,
}

impl TokenConfig {
    pub fn native(chain: Chain) -> Self {
        Self {
            symbol: chain.native_symbol().to_string(),
            address: None,
            decimals: 18,
        }
    }

    pub fn usdt(address: Address) -> Self {
        Self {
            symbol: "USDT".to_string(),
            address: Some(address),
            decimals: 6,
        }
    }
}

/// Per-chain settings for the curation contract
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain: Chain,
    pub rpc_url: String,
    pub contract_address: Address,
    pub confirmation_depth: u64,
    pub max_window_size: u64,
    pub tokens: Vec<TokenConfig>,
}

impl ChainConfig {
    pub fn new(chain: Chain, rpc_url: &str, contract_address: Address) -> Self {
        Self {
            chain,
            rpc_url: rpc_url.to_string(),
            contract_address,
            confirmation_depth: chain.default_confirmation_depth(),
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
            tokens: vec![TokenConfig::native(chain)],
        }
    }

    pub fn with_token(mut self, token: TokenConfig) -> Self {
        self.tokens.push(token);
        self
    }

    pub fn with_confirmation_depth(mut self, depth: u64) -> Self {
        self.confirmation_depth = depth;
        self
    }

    pub fn with_max_window_size(mut self, size: u64) -> Self {
        self.max_window_size = size;
        self
    }

    /// Token matching an event's token field; `None` selects the native coin
    pub fn token_by_address(&self, address: Option<Address>) -> Option<&TokenConfig> {
        self.tokens.iter().find(|t| t.address == address)
    }

    fn from_env(chain: Chain) -> Result<Self, ConfigError> {
        let prefix = chain.as_str().to_uppercase();

        let rpc_url = required(&format!("{}_RPC_URL", prefix))?;
        let contract_address = address(&format!("{}_CURATION_CONTRACT", prefix))?;

        let mut config = ChainConfig::new(chain, &rpc_url, contract_address)
            .with_confirmation_depth(parsed_or(
                &format!("{}_CONFIRMATION_DEPTH", prefix),
                chain.default_confirmation_depth(),
            )?)
            .with_max_window_size(parsed_or(
                &format!("{}_MAX_WINDOW_SIZE", prefix),
                DEFAULT_MAX_WINDOW_SIZE,
            )?);

        let usdt_key = format!("{}_USDT_ADDRESS", prefix);
        if std::env::var(&usdt_key).is_ok() {
            config = config.with_token(TokenConfig::usdt(address(&usdt_key)?));
        }

        Ok(config)
    }
}

/// Settlement queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 8,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub chains: Vec<ChainConfig>,
    pub sync_interval: Duration,
    pub queue: QueueConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled = std::env::var("ENABLED_CHAINS").unwrap_or_else(|_| "optimism".to_string());
        let chains = enabled
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                Chain::from_str(name)
                    .map_err(|e| ConfigError::Message(e.to_string()))
                    .and_then(ChainConfig::from_env)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let defaults = QueueConfig::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/settlement".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            chains,
            sync_interval: Duration::from_secs(parsed_or("SYNC_INTERVAL_SECS", 60)?),
            queue: QueueConfig {
                workers: parsed_or("SETTLEMENT_WORKERS", defaults.workers)?,
                max_attempts: parsed_or("SETTLEMENT_MAX_ATTEMPTS", defaults.max_attempts)?,
                backoff_base: Duration::from_millis(parsed_or(
                    "SETTLEMENT_BACKOFF_BASE_MS",
                    defaults.backoff_base.as_millis() as u64,
                )?),
                backoff_max: Duration::from_millis(parsed_or(
                    "SETTLEMENT_BACKOFF_MAX_MS",
                    defaults.backoff_max.as_millis() as u64,
                )?),
            },
        })
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::NotFound(key.to_string()))
}

fn address(key: &str) -> Result<Address, ConfigError> {
    let raw = required(key)?;
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Message(format!("{} is not an address: {}", key, raw)))
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Message(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

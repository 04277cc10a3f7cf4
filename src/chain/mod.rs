// Read-only access to the chains the curation contract lives on
pub mod curation;
pub mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use tracing::info;

use crate::config::ChainConfig;
use crate::error::AppResult;
use crate::ledger::models::Chain;

/// A contract log as returned by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    /// Set by the node when the log was dropped by a reorg
    pub removed: bool,
}

/// A mined transaction receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub reverted: bool,
    pub from: Address,
    pub to: Option<Address>,
    pub block_number: u64,
    pub logs: Vec<RawLog>,
}

/// Read-only view of one chain, bound to the curation contract on it
#[async_trait]
pub trait ChainReader: Send + Sync {
    fn chain(&self) -> Chain;

    /// The curation contract logs are accepted from
    fn contract_address(&self) -> Address;

    /// `None` while the transaction is not mined
    async fn fetch_receipt(&self, tx_hash: B256) -> AppResult<Option<TxReceipt>>;

    /// Curation logs in `[from_block, to_block]`; both `None` asks the
    /// provider for its default range.
    async fn fetch_logs(
        &self,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> AppResult<Vec<RawLog>>;

    async fn fetch_block_height(&self) -> AppResult<u64>;
}

/// Ledger spelling of an address or hash: lowercase `0x` hex
pub fn ledger_hex(value: impl std::fmt::LowerHex) -> String {
    format!("{:#x}", value)
}

/// A configured chain together with its reader
#[derive(Clone)]
pub struct ChainHandle {
    pub config: ChainConfig,
    pub reader: Arc<dyn ChainReader>,
}

/// Registry of per-chain readers, one per chain and contract
#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<Chain, ChainHandle>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain. Only call this during initialization.
    pub fn register(&mut self, config: ChainConfig, reader: Arc<dyn ChainReader>) {
        info!(chain = %config.chain, contract = %config.contract_address, "Registering chain reader");
        self.chains.insert(config.chain, ChainHandle { config, reader });
    }

    pub fn get(&self, chain: Chain) -> Option<&ChainHandle> {
        self.chains.get(&chain)
    }

    pub fn registered_chains(&self) -> Vec<Chain> {
        self.chains.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_ledger_hex_is_lowercase() {
        let address = address!("0xAbCdEf0123456789abcdef0123456789ABCDEF01");
        assert_eq!(ledger_hex(address), "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(ledger_hex(B256::with_last_byte(1)), format!("0x{}1", "0".repeat(63)));
    }
}

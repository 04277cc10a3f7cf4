// EVM adapter for the ChainReader interface
//
// Three read-only calls through an alloy HTTP provider: the block number,
// transaction receipts and logs filtered to the curation contract. No
// signing, no caching.

use std::time::Duration;

use alloy::network::ReceiptResponse;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::{reqwest::Url, Http};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::curation::curation_topics;
use super::{ChainReader, RawLog, TxReceipt};
use crate::error::{AppError, AppResult};
use crate::ledger::models::Chain;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EvmRpcChainReader {
    chain: Chain,
    contract_address: Address,
    provider: DynProvider,
}

impl EvmRpcChainReader {
    pub fn new(chain: Chain, rpc_url: &str, contract_address: Address) -> AppResult<Self> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("RPC url for {}: {}", chain, e)))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client for {}: {}", chain, e)))?;

        let transport = Http::with_client(client, url);
        let provider = ProviderBuilder::new()
            .connect_client(RpcClient::new(transport, false))
            .erased();

        Ok(Self { chain, contract_address, provider })
    }

    fn reader_error(&self, message: impl Into<String>) -> AppError {
        reader_error(self.chain, message)
    }
}

fn reader_error(chain: Chain, message: impl Into<String>) -> AppError {
    AppError::ChainReader { chain, message: message.into() }
}

/// Nodes omit block fields on pending logs; those cannot be settled yet
pub(crate) fn convert_log(chain: Chain, log: Log) -> AppResult<RawLog> {
    Ok(RawLog {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number: log
            .block_number
            .ok_or_else(|| reader_error(chain, "log without block number"))?,
        tx_hash: log
            .transaction_hash
            .ok_or_else(|| reader_error(chain, "log without transaction hash"))?,
        log_index: log
            .log_index
            .ok_or_else(|| reader_error(chain, "log without log index"))?,
        removed: log.removed,
    })
}

#[async_trait]
impl ChainReader for EvmRpcChainReader {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn contract_address(&self) -> Address {
        self.contract_address
    }

    #[instrument(skip(self), fields(chain = %self.chain))]
    async fn fetch_receipt(&self, tx_hash: B256) -> AppResult<Option<TxReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.reader_error(format!("eth_getTransactionReceipt failed: {}", e)))?;

        let Some(receipt) = receipt else {
            debug!("Receipt not available yet");
            return Ok(None);
        };

        // A receipt without a block number belongs to a pending block
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let logs = receipt
            .inner
            .logs()
            .iter()
            .cloned()
            .map(|log| convert_log(self.chain, log))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Some(TxReceipt {
            tx_hash: receipt.transaction_hash,
            reverted: !ReceiptResponse::status(&receipt),
            from: receipt.from,
            to: receipt.to,
            block_number,
            logs,
        }))
    }

    #[instrument(skip(self), fields(chain = %self.chain))]
    async fn fetch_logs(
        &self,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> AppResult<Vec<RawLog>> {
        let mut filter = Filter::new()
            .address(self.contract_address)
            .event_signature(curation_topics());
        if let Some(from_block) = from_block {
            filter = filter.from_block(from_block);
        }
        if let Some(to_block) = to_block {
            filter = filter.to_block(to_block);
        }

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| self.reader_error(format!("eth_getLogs failed: {}", e)))?;

        logs.into_iter().map(|log| convert_log(self.chain, log)).collect()
    }

    async fn fetch_block_height(&self) -> AppResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| self.reader_error(format!("eth_blockNumber failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rpc_log(block_number: Option<&str>) -> Log {
        serde_json::from_value(json!({
            "address": "0x5edebbdae7b5c79a69aacf7873796bb1ec664db8",
            "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
            "data": "0x",
            "blockHash": null,
            "blockNumber": block_number,
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000ab",
            "transactionIndex": "0x0",
            "logIndex": "0x4",
            "removed": false
        }))
        .unwrap()
    }

    #[test]
    fn test_convert_mined_log() {
        let log = convert_log(Chain::Optimism, rpc_log(Some("0x1c9c380"))).unwrap();
        assert_eq!(log.block_number, 30_000_000);
        assert_eq!(log.log_index, 4);
        assert_eq!(log.tx_hash, B256::with_last_byte(0xab));
        assert_eq!(log.topics.len(), 1);
        assert!(!log.removed);
    }

    #[test]
    fn test_pending_log_is_rejected() {
        let err = convert_log(Chain::Optimism, rpc_log(None)).unwrap_err();
        assert_eq!(err.code(), "CHAIN_READER_ERROR");
    }

    #[test]
    fn test_invalid_rpc_url_is_a_config_error() {
        let contract = Address::ZERO;
        let err = EvmRpcChainReader::new(Chain::Optimism, "not a url", contract)
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }
}

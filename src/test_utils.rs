//! Shared fixtures: a scripted chain reader and ledger seeding helpers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::primitives::{address, Address, B256};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::chain::{ChainHandle, ChainReader, RawLog, TxReceipt};
use crate::config::{ChainConfig, TokenConfig};
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;

pub const CONTRACT: Address = address!("0x5edebbdae7b5c79a69aacf7873796bb1ec664db8");
pub const TOKEN: Address = address!("0x94b008aa00579c1307b0ef2c499ad98a8ce58e58");
pub const CURATOR: Address = address!("0x1111111111111111111111111111111111111111");
pub const CREATOR: Address = address!("0x2222222222222222222222222222222222222222");

/// Chain reader answering from scripted receipts, logs and height
pub struct MockChainReader {
    chain: Chain,
    contract: Address,
    receipts: Mutex<HashMap<B256, TxReceipt>>,
    logs: Mutex<Vec<RawLog>>,
    height: AtomicU64,
    failing: AtomicBool,
    log_calls: Mutex<Vec<(Option<u64>, Option<u64>)>>,
    receipt_calls: AtomicUsize,
}

impl MockChainReader {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            contract: CONTRACT,
            receipts: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
            height: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            log_calls: Mutex::new(Vec::new()),
            receipt_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_receipt(&self, receipt: TxReceipt) {
        self.receipts.lock().insert(receipt.tx_hash, receipt);
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs.lock().push(log);
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Make every call fail, as if the node were unreachable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn log_calls(&self) -> Vec<(Option<u64>, Option<u64>)> {
        self.log_calls.lock().clone()
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ChainReader {
                chain: self.chain,
                message: "node unreachable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn contract_address(&self) -> Address {
        self.contract
    }

    async fn fetch_receipt(&self, tx_hash: B256) -> AppResult<Option<TxReceipt>> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.receipts.lock().get(&tx_hash).cloned())
    }

    async fn fetch_logs(
        &self,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> AppResult<Vec<RawLog>> {
        self.log_calls.lock().push((from_block, to_block));
        self.check()?;
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| from_block.map_or(true, |from| log.block_number >= from))
            .filter(|log| to_block.map_or(true, |to| log.block_number <= to))
            .cloned()
            .collect())
    }

    async fn fetch_block_height(&self) -> AppResult<u64> {
        self.check()?;
        Ok(self.height.load(Ordering::SeqCst))
    }
}

pub fn chain_config(chain: Chain) -> ChainConfig {
    ChainConfig::new(chain, "http://localhost:8545", CONTRACT).with_token(TokenConfig::usdt(TOKEN))
}

pub fn chain_handle(reader: Arc<MockChainReader>) -> ChainHandle {
    ChainHandle {
        config: chain_config(reader.chain()),
        reader,
    }
}

/// A successful receipt carrying the given logs
pub fn receipt(tx_hash: B256, block_number: u64, logs: Vec<RawLog>) -> TxReceipt {
    TxReceipt {
        tx_hash,
        reverted: false,
        from: CURATOR,
        to: Some(CONTRACT),
        block_number,
        logs,
    }
}

pub fn reverted_receipt(tx_hash: B256, block_number: u64) -> TxReceipt {
    TxReceipt {
        reverted: true,
        ..receipt(tx_hash, block_number, vec![])
    }
}

/// Pending USDT donation to an article
pub fn pending_donation(recipient_id: Uuid, target_id: Uuid, amount: Decimal) -> NewTransaction {
    NewTransaction {
        amount,
        currency: "USDT".into(),
        purpose: PURPOSE_DONATION.into(),
        provider: PaymentProvider::Blockchain,
        provider_tx_id: None,
        sender_id: None,
        recipient_id,
        target_id: Some(target_id),
        target_type: Some(TARGET_TYPE_ARTICLE.into()),
        state: TransactionState::Pending,
    }
}

//! In-memory ledger with the same semantics as the Postgres one.
//!
//! A ledger transaction holds the store lock for its whole lifetime and works
//! on a staged copy, so transactions are serializable and a dropped
//! transaction leaves no trace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::*;
use super::store::{LedgerStore, LedgerTx};
use crate::chain::ledger_hex;
use crate::error::{AppError, AppResult};
use crate::reconcile::content::ContentResolver;

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub transactions: HashMap<Uuid, Transaction>,
    pub blockchain_transactions: HashMap<Uuid, BlockchainTransaction>,
    pub curation_events: Vec<CurationEventRecord>,
    pub checkpoints: HashMap<Chain, SyncCheckpoint>,
    /// lowercase address -> user id
    pub users: HashMap<String, Uuid>,
    /// content reference -> content id
    pub contents: HashMap<String, Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, address: Address) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.users.insert(ledger_hex(address), id);
        id
    }

    pub async fn add_content(&self, reference: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.contents.insert(reference.to_string(), id);
        id
    }

    /// Make every subsequent write fail, as if the database went away
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Seed a pending blockchain transaction the way a caller expecting a
    /// specific hash would.
    pub async fn seed_pending_payment(
        &self,
        chain: Chain,
        tx_hash: B256,
        fields: NewTransaction,
    ) -> AppResult<(Transaction, BlockchainTransaction)> {
        let mut tx = self.begin().await?;
        let transaction = tx.create_transaction(fields).await?;
        let blockchain_tx = tx
            .create_blockchain_transaction(NewBlockchainTransaction {
                chain,
                tx_hash: ledger_hex(tx_hash),
                transaction_id: Some(transaction.id),
                state: BlockchainTransactionState::Pending,
                block_number: None,
            })
            .await?
            .ok_or_else(|| AppError::Ledger("duplicate blockchain transaction".into()))?;
        tx.link_blockchain_transaction(blockchain_tx.id, transaction.id).await?;
        let transaction = tx
            .find_transaction(transaction.id)
            .await?
            .ok_or_else(|| AppError::NotFound("transaction".into()))?;
        tx.commit().await?;
        Ok((transaction, blockchain_tx))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryLedgerTx {
            guard,
            staged,
            fail_writes: self.fail_writes.clone(),
        }))
    }
}

#[async_trait]
impl ContentResolver for MemoryLedger {
    async fn resolve_content_reference(&self, reference: &str) -> AppResult<Option<Uuid>> {
        Ok(self.state.lock().await.contents.get(reference).copied())
    }
}

pub struct MemoryLedgerTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryLedgerTx {
    fn check_writable(&self) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Ledger("write rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn find_transaction(&mut self, id: Uuid) -> AppResult<Option<Transaction>> {
        Ok(self.staged.transactions.get(&id).cloned())
    }

    async fn find_transaction_by_provider_tx_id(
        &mut self,
        blockchain_tx_id: Uuid,
    ) -> AppResult<Option<Transaction>> {
        Ok(self
            .staged
            .transactions
            .values()
            .filter(|tx| {
                tx.provider == PaymentProvider::Blockchain
                    && tx.provider_tx_id == Some(blockchain_tx_id)
            })
            .min_by_key(|tx| tx.created_at)
            .cloned())
    }

    async fn find_pending_transaction_by_recipient(
        &mut self,
        criteria: &PendingMatch,
    ) -> AppResult<Option<Transaction>> {
        Ok(self
            .staged
            .transactions
            .values()
            .filter(|tx| {
                tx.provider == PaymentProvider::Blockchain
                    && tx.state == TransactionState::Pending
                    && tx.recipient_id == criteria.recipient_id
                    && tx.target_id == Some(criteria.target_id)
                    && tx.currency == criteria.currency
                    && tx.amount == criteria.amount
                    && tx.provider_tx_id.is_none()
            })
            .min_by_key(|tx| tx.created_at)
            .cloned())
    }

    async fn create_transaction(&mut self, fields: NewTransaction) -> AppResult<Transaction> {
        self.check_writable()?;
        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            amount: fields.amount,
            currency: fields.currency,
            purpose: fields.purpose,
            provider: fields.provider,
            provider_tx_id: fields.provider_tx_id,
            sender_id: fields.sender_id,
            recipient_id: fields.recipient_id,
            target_id: fields.target_id,
            target_type: fields.target_type,
            state: fields.state,
            remark: None,
            created_at: now,
            updated_at: now,
        };
        self.staged.transactions.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    async fn update_transaction_state(
        &mut self,
        id: Uuid,
        update: TransactionStateUpdate,
    ) -> AppResult<Transaction> {
        self.check_writable()?;
        let transaction = self
            .staged
            .transactions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("transaction {}", id)))?;

        if transaction.state == TransactionState::Pending {
            transaction.state = update.state;
            if let Some(remark) = update.remark {
                transaction.remark = Some(remark);
            }
            if let Some(sender_id) = update.sender_id {
                transaction.sender_id = sender_id;
            }
            transaction.updated_at = Utc::now();
        }

        Ok(transaction.clone())
    }

    async fn find_blockchain_transaction(
        &mut self,
        chain: Chain,
        tx_hash: &str,
    ) -> AppResult<Option<BlockchainTransaction>> {
        Ok(self
            .staged
            .blockchain_transactions
            .values()
            .find(|btx| btx.chain == chain && btx.tx_hash == tx_hash)
            .cloned())
    }

    async fn find_blockchain_transaction_by_id(
        &mut self,
        id: Uuid,
    ) -> AppResult<Option<BlockchainTransaction>> {
        Ok(self.staged.blockchain_transactions.get(&id).cloned())
    }

    async fn create_blockchain_transaction(
        &mut self,
        fields: NewBlockchainTransaction,
    ) -> AppResult<Option<BlockchainTransaction>> {
        self.check_writable()?;
        if self.find_blockchain_transaction(fields.chain, &fields.tx_hash).await?.is_some() {
            return Ok(None);
        }

        let now = Utc::now();
        let blockchain_tx = BlockchainTransaction {
            id: Uuid::new_v4(),
            transaction_id: fields.transaction_id,
            chain: fields.chain,
            tx_hash: fields.tx_hash,
            state: fields.state,
            from_address: None,
            to_address: None,
            block_number: fields.block_number,
            created_at: now,
            updated_at: now,
        };
        self.staged
            .blockchain_transactions
            .insert(blockchain_tx.id, blockchain_tx.clone());
        Ok(Some(blockchain_tx))
    }

    async fn update_blockchain_transaction_state(
        &mut self,
        id: Uuid,
        state: BlockchainTransactionState,
    ) -> AppResult<BlockchainTransaction> {
        self.check_writable()?;
        let blockchain_tx = self
            .staged
            .blockchain_transactions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("blockchain transaction {}", id)))?;

        if blockchain_tx.state == BlockchainTransactionState::Pending {
            blockchain_tx.state = state;
            blockchain_tx.updated_at = Utc::now();
        }

        Ok(blockchain_tx.clone())
    }

    async fn record_receipt_facts(
        &mut self,
        id: Uuid,
        from_address: Option<&str>,
        to_address: Option<&str>,
        block_number: Option<i64>,
    ) -> AppResult<()> {
        self.check_writable()?;
        if let Some(blockchain_tx) = self.staged.blockchain_transactions.get_mut(&id) {
            if blockchain_tx.from_address.is_none() {
                blockchain_tx.from_address = from_address.map(str::to_string);
            }
            if blockchain_tx.to_address.is_none() {
                blockchain_tx.to_address = to_address.map(str::to_string);
            }
            if blockchain_tx.block_number.is_none() {
                blockchain_tx.block_number = block_number;
            }
        }
        Ok(())
    }

    async fn link_blockchain_transaction(
        &mut self,
        id: Uuid,
        transaction_id: Uuid,
    ) -> AppResult<()> {
        self.check_writable()?;
        if let Some(blockchain_tx) = self.staged.blockchain_transactions.get_mut(&id) {
            blockchain_tx.transaction_id = Some(transaction_id);
        }
        if let Some(transaction) = self.staged.transactions.get_mut(&transaction_id) {
            transaction.provider_tx_id = Some(id);
        }
        Ok(())
    }

    async fn insert_curation_event(&mut self, event: CurationEventRecord) -> AppResult<()> {
        self.check_writable()?;
        let exists = self.staged.curation_events.iter().any(|existing| {
            existing.blockchain_transaction_id == event.blockchain_transaction_id
                && existing.log_index == event.log_index
        });
        if !exists {
            self.staged.curation_events.push(event);
        }
        Ok(())
    }

    async fn find_checkpoint(&mut self, chain: Chain) -> AppResult<Option<SyncCheckpoint>> {
        Ok(self.staged.checkpoints.get(&chain).cloned())
    }

    async fn upsert_checkpoint(&mut self, chain: Chain, block_number: i64) -> AppResult<()> {
        self.check_writable()?;
        let checkpoint = self.staged.checkpoints.entry(chain).or_insert(SyncCheckpoint {
            chain,
            block_number,
            updated_at: Utc::now(),
        });
        checkpoint.block_number = checkpoint.block_number.max(block_number);
        checkpoint.updated_at = Utc::now();
        Ok(())
    }

    async fn find_user_id_by_chain_address(&mut self, address: &str) -> AppResult<Option<Uuid>> {
        Ok(self.staged.users.get(&address.to_lowercase()).copied())
    }

    async fn find_chain_address_by_user_id(&mut self, user_id: Uuid) -> AppResult<Option<String>> {
        Ok(self
            .staged
            .users
            .iter()
            .find(|(_, id)| **id == user_id)
            .map(|(address, _)| address.clone()))
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryLedgerTx { mut guard, staged, .. } = *self;
        *guard = staged;
        Ok(())
    }
}

use async_trait::async_trait;
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Ledger store - THE source of truth for settlement state
///
/// Every read-decide-write goes through one [`LedgerTx`]; dropping a
/// transaction without calling `commit` rolls it back.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>>;
}

/// One ledger transaction.
///
/// Finds on transactions and blockchain transactions lock the row until the
/// ledger transaction ends, so a decision made on what was read cannot be
/// invalidated by a concurrent writer.
#[async_trait]
pub trait LedgerTx: Send {
    // ========== TRANSACTIONS ==========

    async fn find_transaction(&mut self, id: Uuid) -> AppResult<Option<Transaction>>;

    /// Oldest transaction whose provider_tx_id points at the blockchain transaction.
    async fn find_transaction_by_provider_tx_id(
        &mut self,
        blockchain_tx_id: Uuid,
    ) -> AppResult<Option<Transaction>>;

    /// Oldest pending blockchain transaction for the recipient that is not yet
    /// linked to an on-chain transaction and pays the same target/amount.
    async fn find_pending_transaction_by_recipient(
        &mut self,
        criteria: &PendingMatch,
    ) -> AppResult<Option<Transaction>>;

    async fn create_transaction(&mut self, fields: NewTransaction) -> AppResult<Transaction>;

    /// Apply the update only if the row is still pending.
    /// Returns the row as stored after the call.
    async fn update_transaction_state(
        &mut self,
        id: Uuid,
        update: TransactionStateUpdate,
    ) -> AppResult<Transaction>;

    // ========== BLOCKCHAIN TRANSACTIONS ==========

    async fn find_blockchain_transaction(
        &mut self,
        chain: Chain,
        tx_hash: &str,
    ) -> AppResult<Option<BlockchainTransaction>>;

    async fn find_blockchain_transaction_by_id(
        &mut self,
        id: Uuid,
    ) -> AppResult<Option<BlockchainTransaction>>;

    /// Insert unless (chain, tx_hash) already exists. `None` means another
    /// writer got there first and the caller should look the row up.
    async fn create_blockchain_transaction(
        &mut self,
        fields: NewBlockchainTransaction,
    ) -> AppResult<Option<BlockchainTransaction>>;

    /// Apply the state only if the row is still pending.
    async fn update_blockchain_transaction_state(
        &mut self,
        id: Uuid,
        state: BlockchainTransactionState,
    ) -> AppResult<BlockchainTransaction>;

    /// Fill in facts taken from a final receipt; already known facts are kept.
    async fn record_receipt_facts(
        &mut self,
        id: Uuid,
        from_address: Option<&str>,
        to_address: Option<&str>,
        block_number: Option<i64>,
    ) -> AppResult<()>;

    /// Point the blockchain transaction and the ledger transaction at each other
    async fn link_blockchain_transaction(&mut self, id: Uuid, transaction_id: Uuid)
        -> AppResult<()>;

    /// Idempotent on (blockchain_transaction_id, log_index)
    async fn insert_curation_event(&mut self, event: CurationEventRecord) -> AppResult<()>;

    // ========== CHECKPOINTS ==========

    async fn find_checkpoint(&mut self, chain: Chain) -> AppResult<Option<SyncCheckpoint>>;

    /// Never moves a checkpoint backwards
    async fn upsert_checkpoint(&mut self, chain: Chain, block_number: i64) -> AppResult<()>;

    // ========== USERS ==========

    async fn find_user_id_by_chain_address(&mut self, address: &str) -> AppResult<Option<Uuid>>;

    async fn find_chain_address_by_user_id(&mut self, user_id: Uuid) -> AppResult<Option<String>>;

    async fn commit(self: Box<Self>) -> AppResult<()>;
}

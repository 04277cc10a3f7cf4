use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::{LedgerStore, LedgerTx};
use crate::error::{AppError, AppResult};
use crate::reconcile::content::ContentResolver;

const TRANSACTION_COLUMNS: &str = r#"
    id, amount, currency, purpose, provider, provider_tx_id, sender_id, recipient_id,
    target_id, target_type, state, remark, created_at, updated_at
"#;

const BLOCKCHAIN_TRANSACTION_COLUMNS: &str = r#"
    id, transaction_id, chain_id, tx_hash, state, from_address, to_address, block_number,
    created_at, updated_at
"#;

/// Postgres-backed ledger
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }
}

#[async_trait]
impl ContentResolver for LedgerRepository {
    async fn resolve_content_reference(&self, reference: &str) -> AppResult<Option<Uuid>> {
        let content_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM article
            WHERE data_hash = $1
            LIMIT 1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(content_id)
    }
}

/// One Postgres transaction. Rolled back on drop unless committed.
pub struct PgLedgerTx {
    tx: PgTransaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    // ========== TRANSACTIONS ==========

    async fn find_transaction(&mut self, id: Uuid) -> AppResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_transaction WHERE id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(Transaction::from_row).transpose()
    }

    async fn find_transaction_by_provider_tx_id(
        &mut self,
        blockchain_tx_id: Uuid,
    ) -> AppResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM payment_transaction
            WHERE provider = $1 AND provider_tx_id = $2
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(PaymentProvider::Blockchain)
        .bind(blockchain_tx_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(Transaction::from_row).transpose()
    }

    async fn find_pending_transaction_by_recipient(
        &mut self,
        criteria: &PendingMatch,
    ) -> AppResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM payment_transaction
            WHERE provider = $1
              AND state = $2
              AND recipient_id = $3
              AND target_id = $4
              AND currency = $5
              AND amount = $6
              AND provider_tx_id IS NULL
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(PaymentProvider::Blockchain)
        .bind(TransactionState::Pending)
        .bind(criteria.recipient_id)
        .bind(criteria.target_id)
        .bind(&criteria.currency)
        .bind(criteria.amount)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(Transaction::from_row).transpose()
    }

    async fn create_transaction(&mut self, fields: NewTransaction) -> AppResult<Transaction> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO payment_transaction (
                amount, currency, purpose, provider, provider_tx_id, sender_id,
                recipient_id, target_id, target_type, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(fields.amount)
        .bind(&fields.currency)
        .bind(&fields.purpose)
        .bind(fields.provider)
        .bind(fields.provider_tx_id)
        .bind(fields.sender_id)
        .bind(fields.recipient_id)
        .bind(fields.target_id)
        .bind(&fields.target_type)
        .bind(fields.state)
        .fetch_one(&mut *self.tx)
        .await?;

        Transaction::from_row(&row)
    }

    async fn update_transaction_state(
        &mut self,
        id: Uuid,
        update: TransactionStateUpdate,
    ) -> AppResult<Transaction> {
        let (set_sender, sender_id) = match update.sender_id {
            Some(sender_id) => (true, sender_id),
            None => (false, None),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE payment_transaction
            SET state = $2,
                remark = COALESCE($3, remark),
                sender_id = CASE WHEN $4 THEN $5 ELSE sender_id END,
                updated_at = NOW()
            WHERE id = $1 AND state = $6
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(update.state)
        .bind(&update.remark)
        .bind(set_sender)
        .bind(sender_id)
        .bind(TransactionState::Pending)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Transaction::from_row(&row),
            None => self
                .find_transaction(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("transaction {}", id))),
        }
    }

    // ========== BLOCKCHAIN TRANSACTIONS ==========

    async fn find_blockchain_transaction(
        &mut self,
        chain: Chain,
        tx_hash: &str,
    ) -> AppResult<Option<BlockchainTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM blockchain_transaction WHERE chain_id = $1 AND tx_hash = $2 FOR UPDATE",
            BLOCKCHAIN_TRANSACTION_COLUMNS
        ))
        .bind(chain.id())
        .bind(tx_hash)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(BlockchainTransaction::from_row).transpose()
    }

    async fn find_blockchain_transaction_by_id(
        &mut self,
        id: Uuid,
    ) -> AppResult<Option<BlockchainTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM blockchain_transaction WHERE id = $1 FOR UPDATE",
            BLOCKCHAIN_TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(BlockchainTransaction::from_row).transpose()
    }

    async fn create_blockchain_transaction(
        &mut self,
        fields: NewBlockchainTransaction,
    ) -> AppResult<Option<BlockchainTransaction>> {
        // Unique (chain_id, tx_hash): the loser of an insert race gets no row back
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO blockchain_transaction (chain_id, tx_hash, transaction_id, state, block_number)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chain_id, tx_hash) DO NOTHING
            RETURNING {}
            "#,
            BLOCKCHAIN_TRANSACTION_COLUMNS
        ))
        .bind(fields.chain.id())
        .bind(&fields.tx_hash)
        .bind(fields.transaction_id)
        .bind(fields.state)
        .bind(fields.block_number)
        .fetch_optional(&mut *self.tx)
        .await?;

        if row.is_none() {
            debug!(chain = %fields.chain, tx_hash = %fields.tx_hash, "Blockchain transaction already exists");
        }

        row.as_ref().map(BlockchainTransaction::from_row).transpose()
    }

    async fn update_blockchain_transaction_state(
        &mut self,
        id: Uuid,
        state: BlockchainTransactionState,
    ) -> AppResult<BlockchainTransaction> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE blockchain_transaction
            SET state = $2, updated_at = NOW()
            WHERE id = $1 AND state = $3
            RETURNING {}
            "#,
            BLOCKCHAIN_TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(state)
        .bind(BlockchainTransactionState::Pending)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => BlockchainTransaction::from_row(&row),
            None => self
                .find_blockchain_transaction_by_id(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("blockchain transaction {}", id))),
        }
    }

    async fn record_receipt_facts(
        &mut self,
        id: Uuid,
        from_address: Option<&str>,
        to_address: Option<&str>,
        block_number: Option<i64>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE blockchain_transaction
            SET from_address = COALESCE(from_address, $2),
                to_address = COALESCE(to_address, $3),
                block_number = COALESCE(block_number, $4),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(from_address)
        .bind(to_address)
        .bind(block_number)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn link_blockchain_transaction(
        &mut self,
        id: Uuid,
        transaction_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE blockchain_transaction
            SET transaction_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(transaction_id)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE payment_transaction
            SET provider_tx_id = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(id)
        .bind(transaction_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_curation_event(&mut self, event: CurationEventRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blockchain_curation_event (
                blockchain_transaction_id, log_index, curator_address, creator_address,
                token_address, uri, amount
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (blockchain_transaction_id, log_index) DO NOTHING
            "#,
        )
        .bind(event.blockchain_transaction_id)
        .bind(event.log_index)
        .bind(&event.curator_address)
        .bind(&event.creator_address)
        .bind(&event.token_address)
        .bind(&event.uri)
        .bind(event.amount)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    // ========== CHECKPOINTS ==========

    async fn find_checkpoint(&mut self, chain: Chain) -> AppResult<Option<SyncCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, block_number, updated_at
            FROM blockchain_sync_record
            WHERE chain_id = $1
            "#,
        )
        .bind(chain.id())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(SyncCheckpoint::from_row).transpose()
    }

    async fn upsert_checkpoint(&mut self, chain: Chain, block_number: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blockchain_sync_record (chain_id, block_number)
            VALUES ($1, $2)
            ON CONFLICT (chain_id) DO UPDATE
            SET block_number = GREATEST(blockchain_sync_record.block_number, EXCLUDED.block_number),
                updated_at = NOW()
            "#,
        )
        .bind(chain.id())
        .bind(block_number)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    // ========== USERS ==========

    async fn find_user_id_by_chain_address(&mut self, address: &str) -> AppResult<Option<Uuid>> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM users
            WHERE lower(eth_address) = lower($1)
            LIMIT 1
            "#,
        )
        .bind(address)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(user_id)
    }

    async fn find_chain_address_by_user_id(&mut self, user_id: Uuid) -> AppResult<Option<String>> {
        let address = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT eth_address FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .flatten();

        Ok(address.map(|address| address.to_lowercase()))
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

// Settlement worker: settles one known transaction from its receipt
pub mod queue;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::chain::ChainRegistry;
use crate::error::{AppResult, SettlementError};
use crate::ledger::models::PaymentProvider;
use crate::reconcile::{ReceiptOutcome, ReconciliationEngine};

/// Result of a successful settlement job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementReceipt {
    pub transaction_id: Uuid,
    pub outcome: ReceiptOutcome,
}

pub struct SettlementWorker {
    engine: ReconciliationEngine,
    chains: Arc<ChainRegistry>,
}

impl SettlementWorker {
    pub fn new(engine: ReconciliationEngine, chains: Arc<ChainRegistry>) -> Self {
        Self { engine, chains }
    }

    /// Settle a pending blockchain transaction.
    ///
    /// Preconditions are checked in order and each failure carries its own
    /// code; only `NOT_MINED` is worth retrying.
    #[instrument(skip(self))]
    pub async fn settle(&self, transaction_id: Uuid) -> AppResult<SettlementReceipt> {
        let (blockchain_tx_id, chain) = {
            let mut tx = self.engine.ledger().begin().await?;

            let transaction = tx
                .find_transaction(transaction_id)
                .await?
                .filter(|t| t.is_pending())
                .ok_or(SettlementError::TxNotFound(transaction_id))?;

            if transaction.provider != PaymentProvider::Blockchain {
                return Err(SettlementError::WrongQueue {
                    transaction_id,
                    provider: transaction.provider.as_str().to_string(),
                }
                .into());
            }

            let blockchain_tx = match transaction.provider_tx_id {
                Some(id) => tx.find_blockchain_transaction_by_id(id).await?,
                None => None,
            }
            .ok_or(SettlementError::BlockchainTxNotFound(transaction_id))?;

            (blockchain_tx.id, blockchain_tx.chain)
        };

        let handle = self
            .chains
            .get(chain)
            .ok_or(SettlementError::UnsupportedChain(chain.id()))?;

        let outcome = self
            .engine
            .resolve_receipt(handle, blockchain_tx_id, transaction_id)
            .await?;
        info!(%transaction_id, ?outcome, "✓ Settlement job completed");

        Ok(SettlementReceipt { transaction_id, outcome })
    }
}

// Reconciliation engine: the only writer of settlement state
//
// Both the settlement worker and the log synchronizer funnel through here.
// Every decision re-reads the rows it touches inside one ledger transaction,
// so the two paths may interleave freely.

pub mod content;
pub mod state;
pub mod validation;

use std::sync::Arc;

use alloy::primitives::B256;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use self::content::ContentResolver;
use self::state::{validate_blockchain_transition, validate_transaction_transition};
use self::validation::{check_expected_payment, screen_event, InvalidReason, ScreenedPayment};
use crate::chain::curation::{decode_curation_log, CurationEvent};
use crate::chain::{ledger_hex, ChainHandle, RawLog};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::*;
use crate::ledger::{LedgerStore, LedgerTx};

/// Final result of settling a transaction from its receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptOutcome {
    Succeeded,
    Failed,
    Canceled,
}

impl ReceiptOutcome {
    fn from_state(state: TransactionState) -> Option<Self> {
        match state {
            TransactionState::Pending => None,
            TransactionState::Succeeded => Some(ReceiptOutcome::Succeeded),
            TransactionState::Failed => Some(ReceiptOutcome::Failed),
            TransactionState::Canceled => Some(ReceiptOutcome::Canceled),
        }
    }
}

/// What applying one log did to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Reorged out, nothing touched
    Removed,
    /// Not a decodable curation log from the contract, nothing touched
    Malformed,
    /// Recorded for audit, not credited
    Invalid { reason: InvalidReason },
    /// An existing pending transaction was settled by this event
    Linked { transaction_id: Uuid },
    /// The receipt does not pay what the linked pending transaction expects
    Rejected { transaction_id: Uuid },
    /// No pending transaction matched, a settled one was created
    Created { transaction_id: Uuid },
    /// The matching transaction was already terminal
    AlreadySettled { transaction_id: Uuid },
}

/// A curation event found in a receipt, with the ledger-independent checks done
struct ObservedEvent {
    log_index: i64,
    event: CurationEvent,
    verdict: Result<ScreenedPayment, InvalidReason>,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    ledger: Arc<dyn LedgerStore>,
    content: Arc<dyn ContentResolver>,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, content: Arc<dyn ContentResolver>) -> Self {
        Self { ledger, content }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Settle a pending transaction, and the blockchain transaction it pays
    /// through, from the chain receipt.
    ///
    /// An unlinked blockchain transaction is linked to `transaction_id`; one
    /// linked to another transaction is `ALREADY_LINKED`. Returns `NOT_MINED`
    /// while the receipt is missing. Once the transaction is terminal its
    /// stored outcome is returned without asking the chain.
    #[instrument(skip(self, chain), fields(chain = %chain.config.chain))]
    pub async fn resolve_receipt(
        &self,
        chain: &ChainHandle,
        blockchain_tx_id: Uuid,
        transaction_id: Uuid,
    ) -> AppResult<ReceiptOutcome> {
        let tx_hash = {
            let mut tx = self.ledger.begin().await?;
            let (blockchain_tx, transaction) =
                load_pair(&mut *tx, blockchain_tx_id, transaction_id).await?;
            let stored = settle_from_stored(&mut *tx, &blockchain_tx, &transaction).await?;
            tx.commit().await?;
            if let Some(outcome) = stored {
                debug!(?outcome, "Transaction already settled");
                return Ok(outcome);
            }
            parse_tx_hash(&blockchain_tx.tx_hash)?
        };

        let receipt = chain
            .reader
            .fetch_receipt(tx_hash)
            .await?
            .ok_or_else(|| SettlementError::NotMined(ledger_hex(tx_hash)))?;

        let contract = chain.reader.contract_address();
        let mut observed = Vec::new();
        if !receipt.reverted {
            for log in receipt.logs.iter().filter(|log| !log.removed && log.address == contract) {
                let Ok(log_index) = i64::try_from(log.log_index) else {
                    warn!(log_index = log.log_index, "Skipping receipt log with out of range index");
                    continue;
                };
                match decode_curation_log(log) {
                    Ok(event) => {
                        let verdict = screen_event(&chain.config, self.content.as_ref(), &event).await?;
                        observed.push(ObservedEvent { log_index, event, verdict });
                    }
                    Err(e) => warn!(log_index = log.log_index, error = %e, "Skipping undecodable receipt log"),
                }
            }
        }

        let block_number = to_ledger_number(receipt.block_number, "block number")?;

        let mut tx = self.ledger.begin().await?;
        let (blockchain_tx, transaction) = load_pair(&mut *tx, blockchain_tx_id, transaction_id).await?;
        if let Some(outcome) = settle_from_stored(&mut *tx, &blockchain_tx, &transaction).await? {
            tx.commit().await?;
            return Ok(outcome);
        }

        let from_address = ledger_hex(receipt.from);
        let to_address = receipt.to.map(ledger_hex);
        tx.record_receipt_facts(
            blockchain_tx.id,
            Some(from_address.as_str()),
            to_address.as_deref(),
            Some(block_number),
        )
        .await?;

        let outcome = if receipt.reverted {
            transition_blockchain(&mut *tx, &blockchain_tx, BlockchainTransactionState::Reverted).await?;
            transition_transaction(
                &mut *tx,
                &transaction,
                TransactionStateUpdate::to(TransactionState::Failed),
            )
            .await?;
            warn!(tx_hash = %blockchain_tx.tx_hash, "Transaction reverted on chain");
            ReceiptOutcome::Failed
        } else {
            transition_blockchain(&mut *tx, &blockchain_tx, BlockchainTransactionState::Succeeded)
                .await?;
            for observed_event in &observed {
                tx.insert_curation_event(event_record(
                    blockchain_tx.id,
                    observed_event.log_index,
                    &observed_event.event,
                ))
                .await?;
            }
            settle_against_receipt(&mut *tx, &transaction, &observed).await?
        };

        tx.commit().await?;
        info!(tx_hash = %blockchain_tx.tx_hash, %transaction_id, ?outcome, "Receipt resolved");
        Ok(outcome)
    }

    /// Apply one contract log observed by the synchronizer.
    ///
    /// A log for a transaction hash some pending transaction already waits
    /// on is decided from the receipt, the same way the settlement worker
    /// decides it. Invalid events are handled outcomes, never errors; only
    /// ledger and chain failures are returned as `Err`.
    #[instrument(
        skip(self, chain, log),
        fields(chain = %chain.config.chain, tx_hash = %log.tx_hash, log_index = log.log_index)
    )]
    pub async fn apply_curation_event(
        &self,
        chain: &ChainHandle,
        log: &RawLog,
    ) -> AppResult<ApplyOutcome> {
        if log.removed {
            debug!("Skipping removed log");
            return Ok(ApplyOutcome::Removed);
        }

        if log.address != chain.reader.contract_address() {
            warn!(address = %log.address, "Log not emitted by the curation contract");
            return Ok(ApplyOutcome::Malformed);
        }

        let (Ok(block_number), Ok(log_index)) =
            (i64::try_from(log.block_number), i64::try_from(log.log_index))
        else {
            warn!(block_number = log.block_number, "Log position out of ledger range");
            return Ok(ApplyOutcome::Malformed);
        };

        let event = match decode_curation_log(log) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable curation log");
                return Ok(ApplyOutcome::Malformed);
            }
        };

        let verdict = screen_event(&chain.config, self.content.as_ref(), &event).await?;
        let tx_hash = ledger_hex(log.tx_hash);

        let mut tx = self.ledger.begin().await?;

        let blockchain_tx =
            get_or_create_blockchain_transaction(&mut *tx, chain.config.chain, &tx_hash, block_number)
                .await?;
        if blockchain_tx.state == BlockchainTransactionState::Reverted {
            warn!("Curation log observed for a transaction stored as reverted");
        } else {
            transition_blockchain(&mut *tx, &blockchain_tx, BlockchainTransactionState::Succeeded)
                .await?;
        }
        tx.record_receipt_facts(blockchain_tx.id, None, None, Some(block_number)).await?;
        tx.insert_curation_event(event_record(blockchain_tx.id, log_index, &event)).await?;

        let linked = match blockchain_tx.transaction_id {
            Some(transaction_id) => Some(tx.find_transaction(transaction_id).await?.ok_or_else(|| {
                AppError::Ledger(format!(
                    "blockchain transaction {} links missing transaction {}",
                    blockchain_tx.id, transaction_id
                ))
            })?),
            None => tx.find_transaction_by_provider_tx_id(blockchain_tx.id).await?,
        };

        if let Some(transaction) = linked {
            if !transaction.is_pending() {
                tx.commit().await?;
                return Ok(ApplyOutcome::AlreadySettled { transaction_id: transaction.id });
            }
            // The expectation on file decides, not the log alone
            tx.commit().await?;
            let outcome = self
                .resolve_receipt(chain, blockchain_tx.id, transaction.id)
                .await?;
            let applied = match outcome {
                ReceiptOutcome::Succeeded => ApplyOutcome::Linked { transaction_id: transaction.id },
                ReceiptOutcome::Failed | ReceiptOutcome::Canceled => {
                    ApplyOutcome::Rejected { transaction_id: transaction.id }
                }
            };
            info!(outcome = ?applied, "Curation event applied");
            return Ok(applied);
        }

        let payment = match verdict {
            Ok(payment) => payment,
            Err(reason) => {
                tx.commit().await?;
                info!(%reason, "Curation event recorded but not credited");
                return Ok(ApplyOutcome::Invalid { reason });
            }
        };

        let Some(recipient_id) = tx.find_user_id_by_chain_address(&ledger_hex(event.creator)).await?
        else {
            tx.commit().await?;
            let reason = InvalidReason::UnknownCreator;
            info!(%reason, creator = %event.creator, "Curation event recorded but not credited");
            return Ok(ApplyOutcome::Invalid { reason });
        };
        let sender_id = tx.find_user_id_by_chain_address(&ledger_hex(event.curator)).await?;

        let criteria = PendingMatch {
            recipient_id,
            target_id: payment.content_id,
            currency: payment.currency.clone(),
            amount: payment.amount,
        };
        let outcome = match tx.find_pending_transaction_by_recipient(&criteria).await? {
            Some(transaction) => {
                tx.link_blockchain_transaction(blockchain_tx.id, transaction.id).await?;
                settle_observed(&mut *tx, &transaction, sender_id).await?;
                ApplyOutcome::Linked { transaction_id: transaction.id }
            }
            None => {
                let created = tx
                    .create_transaction(NewTransaction {
                        amount: payment.amount,
                        currency: payment.currency,
                        purpose: PURPOSE_DONATION.to_string(),
                        provider: PaymentProvider::Blockchain,
                        provider_tx_id: Some(blockchain_tx.id),
                        sender_id,
                        recipient_id,
                        target_id: Some(payment.content_id),
                        target_type: Some(TARGET_TYPE_ARTICLE.to_string()),
                        state: TransactionState::Succeeded,
                    })
                    .await?;
                tx.link_blockchain_transaction(blockchain_tx.id, created.id).await?;
                ApplyOutcome::Created { transaction_id: created.id }
            }
        };

        tx.commit().await?;
        info!(?outcome, anonymous = sender_id.is_none(), "Curation event applied");
        Ok(outcome)
    }
}

fn to_ledger_number(value: u64, what: &str) -> AppResult<i64> {
    i64::try_from(value)
        .map_err(|_| AppError::from(SettlementError::MalformedPayload(format!("{} {} out of range", what, value))))
}

fn parse_tx_hash(tx_hash: &str) -> AppResult<B256> {
    tx_hash
        .parse()
        .map_err(|_| SettlementError::MalformedPayload(format!("stored tx hash {}", tx_hash)).into())
}

fn event_record(
    blockchain_transaction_id: Uuid,
    log_index: i64,
    event: &CurationEvent,
) -> CurationEventRecord {
    CurationEventRecord {
        blockchain_transaction_id,
        log_index,
        curator_address: ledger_hex(event.curator),
        creator_address: ledger_hex(event.creator),
        token_address: event.token.map(ledger_hex),
        uri: event.uri.clone(),
        amount: event.amount,
    }
}

/// Read a blockchain transaction and the transaction it settles, both locked,
/// linking them when the blockchain transaction is not linked yet.
async fn load_pair(
    tx: &mut dyn LedgerTx,
    blockchain_tx_id: Uuid,
    transaction_id: Uuid,
) -> AppResult<(BlockchainTransaction, Transaction)> {
    let mut blockchain_tx = tx
        .find_blockchain_transaction_by_id(blockchain_tx_id)
        .await?
        .ok_or(SettlementError::BlockchainTxNotFound(transaction_id))?;

    let transaction = tx
        .find_transaction(transaction_id)
        .await?
        .ok_or(SettlementError::TxNotFound(transaction_id))?;

    match blockchain_tx.transaction_id {
        Some(linked_to) if linked_to != transaction_id => {
            return Err(SettlementError::LinkedElsewhere { blockchain_tx_id, linked_to }.into());
        }
        Some(_) => {}
        None => {
            tx.link_blockchain_transaction(blockchain_tx_id, transaction_id).await?;
            blockchain_tx.transaction_id = Some(transaction_id);
            debug!(%blockchain_tx_id, %transaction_id, "Linked blockchain transaction");
        }
    }

    Ok((blockchain_tx, transaction))
}

/// Outcome decidable from stored state alone, `None` when the receipt is needed.
/// A reverted chain fact fails a transaction left pending.
async fn settle_from_stored(
    tx: &mut dyn LedgerTx,
    blockchain_tx: &BlockchainTransaction,
    transaction: &Transaction,
) -> AppResult<Option<ReceiptOutcome>> {
    if let Some(outcome) = ReceiptOutcome::from_state(transaction.state) {
        return Ok(Some(outcome));
    }
    match blockchain_tx.state {
        BlockchainTransactionState::Reverted => {
            transition_transaction(tx, transaction, TransactionStateUpdate::to(TransactionState::Failed))
                .await?;
            Ok(Some(ReceiptOutcome::Failed))
        }
        // A succeeded chain fact says nothing about what this transaction expects
        BlockchainTransactionState::Pending | BlockchainTransactionState::Succeeded => Ok(None),
    }
}

/// Decide a pending transaction from the curation events of its receipt
async fn settle_against_receipt(
    tx: &mut dyn LedgerTx,
    transaction: &Transaction,
    observed: &[ObservedEvent],
) -> AppResult<ReceiptOutcome> {
    let recipient_address = tx.find_chain_address_by_user_id(transaction.recipient_id).await?;

    let mut first_rejection = None;
    let mut matched = None;
    for observed_event in observed {
        let result = match &observed_event.verdict {
            Ok(payment) => check_expected_payment(
                transaction,
                recipient_address.as_deref(),
                &observed_event.event,
                payment,
            ),
            Err(reason) => Err(*reason),
        };
        match result {
            Ok(()) => {
                matched = Some(observed_event);
                break;
            }
            Err(reason) => {
                first_rejection.get_or_insert(reason);
            }
        }
    }

    match matched {
        Some(observed_event) => {
            let sender_id = tx
                .find_user_id_by_chain_address(&ledger_hex(observed_event.event.curator))
                .await?;
            if sender_id.is_none() {
                info!(payer = %observed_event.event.curator, "Payer is not a platform user, settling anonymously");
            }
            transition_transaction(
                tx,
                transaction,
                TransactionStateUpdate::to(TransactionState::Succeeded).with_sender(sender_id),
            )
            .await?;
            Ok(ReceiptOutcome::Succeeded)
        }
        None => {
            let reason = first_rejection.unwrap_or(InvalidReason::MissingCurationEvent);
            warn!(transaction_id = %transaction.id, %reason, "Receipt does not pay the expected transaction");
            transition_transaction(
                tx,
                transaction,
                TransactionStateUpdate::to(TransactionState::Canceled).with_remark(REMARK_INVALID),
            )
            .await?;
            Ok(ReceiptOutcome::Canceled)
        }
    }
}

/// Succeed a pending transaction matched by an observed log. A sender
/// already on file is kept.
async fn settle_observed(
    tx: &mut dyn LedgerTx,
    transaction: &Transaction,
    sender_id: Option<Uuid>,
) -> AppResult<Transaction> {
    let mut update = TransactionStateUpdate::to(TransactionState::Succeeded);
    if transaction.sender_id.is_none() && sender_id.is_some() {
        update = update.with_sender(sender_id);
    }
    transition_transaction(tx, transaction, update).await
}

async fn get_or_create_blockchain_transaction(
    tx: &mut dyn LedgerTx,
    chain: Chain,
    tx_hash: &str,
    block_number: i64,
) -> AppResult<BlockchainTransaction> {
    if let Some(existing) = tx.find_blockchain_transaction(chain, tx_hash).await? {
        return Ok(existing);
    }

    let created = tx
        .create_blockchain_transaction(NewBlockchainTransaction {
            chain,
            tx_hash: tx_hash.to_string(),
            transaction_id: None,
            state: BlockchainTransactionState::Pending,
            block_number: Some(block_number),
        })
        .await?;

    match created {
        Some(blockchain_tx) => Ok(blockchain_tx),
        // Lost the insert race, the winner's row is visible now
        None => tx
            .find_blockchain_transaction(chain, tx_hash)
            .await?
            .ok_or_else(|| AppError::Ledger(format!("blockchain transaction {} vanished", tx_hash))),
    }
}

async fn transition_blockchain(
    tx: &mut dyn LedgerTx,
    blockchain_tx: &BlockchainTransaction,
    to: BlockchainTransactionState,
) -> AppResult<()> {
    if blockchain_tx.state == to {
        return Ok(());
    }
    validate_blockchain_transition(blockchain_tx.state, to)?;
    tx.update_blockchain_transaction_state(blockchain_tx.id, to).await?;
    Ok(())
}

async fn transition_transaction(
    tx: &mut dyn LedgerTx,
    transaction: &Transaction,
    update: TransactionStateUpdate,
) -> AppResult<Transaction> {
    validate_transaction_transition(transaction.state, update.state)?;
    let stored = tx.update_transaction_state(transaction.id, update).await?;
    debug!(transaction_id = %stored.id, state = ?stored.state, "Transaction state updated");
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::curation::encode::LogBuilder;
    use crate::ledger::MemoryLedger;
    use crate::test_utils::*;
    use alloy::primitives::{address, b256, Address};
    use rust_decimal_macros::dec;

    const HASH: B256 = b256!("0xaaaa000000000000000000000000000000000000000000000000000000000001");

    struct Fixture {
        ledger: MemoryLedger,
        reader: Arc<MockChainReader>,
        handle: ChainHandle,
        engine: ReconciliationEngine,
        creator_id: Uuid,
        content_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let ledger = MemoryLedger::new();
        let reader = Arc::new(MockChainReader::new(Chain::Optimism));
        let handle = chain_handle(reader.clone());
        let engine = ReconciliationEngine::new(Arc::new(ledger.clone()), Arc::new(ledger.clone()));
        let creator_id = ledger.add_user(CREATOR).await;
        let content_id = ledger.add_content("QmArticle").await;
        Fixture { ledger, reader, handle, engine, creator_id, content_id }
    }

    fn usdt_log(creator: Address, amount: u128) -> RawLog {
        LogBuilder::erc20(CONTRACT, CURATOR, creator, TOKEN, "ipfs://QmArticle", amount)
            .tx_hash(HASH)
            .block(100)
            .log_index(3)
            .build()
    }

    #[tokio::test]
    async fn test_valid_receipt_settles_both_rows() {
        let f = fixture().await;
        let curator_id = f.ledger.add_user(CURATOR).await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        f.reader.set_receipt(receipt(HASH, 100, vec![usdt_log(CREATOR, 2_500_000)]));

        let outcome = f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Succeeded);

        let state = f.ledger.snapshot().await;
        let stored = &state.transactions[&transaction.id];
        assert_eq!(stored.state, TransactionState::Succeeded);
        assert_eq!(stored.sender_id, Some(curator_id));
        let stored_btx = &state.blockchain_transactions[&blockchain_tx.id];
        assert_eq!(stored_btx.state, BlockchainTransactionState::Succeeded);
        assert_eq!(stored_btx.block_number, Some(100));
        assert_eq!(stored_btx.from_address, Some(ledger_hex(CURATOR)));
        assert_eq!(state.curation_events.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_payer_settles_anonymously() {
        let f = fixture().await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        f.reader.set_receipt(receipt(HASH, 100, vec![usdt_log(CREATOR, 2_500_000)]));

        let outcome = f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Succeeded);

        let stored = &f.ledger.snapshot().await.transactions[&transaction.id];
        assert_eq!(stored.state, TransactionState::Succeeded);
        assert_eq!(stored.sender_id, None);
    }

    #[tokio::test]
    async fn test_reverted_receipt_fails_transaction() {
        let f = fixture().await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        f.reader.set_receipt(reverted_receipt(HASH, 100));

        let outcome = f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Failed);

        let state = f.ledger.snapshot().await;
        assert_eq!(state.transactions[&transaction.id].state, TransactionState::Failed);
        assert_eq!(
            state.blockchain_transactions[&blockchain_tx.id].state,
            BlockchainTransactionState::Reverted
        );
    }

    #[tokio::test]
    async fn test_invalid_receipt_cancels_with_remark() {
        let f = fixture().await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        f.reader.set_receipt(receipt(HASH, 100, vec![usdt_log(Address::ZERO, 2_500_000)]));

        let outcome = f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Canceled);

        let state = f.ledger.snapshot().await;
        let stored = &state.transactions[&transaction.id];
        assert_eq!(stored.state, TransactionState::Canceled);
        assert_eq!(stored.remark.as_deref(), Some(REMARK_INVALID));
        assert_eq!(
            state.blockchain_transactions[&blockchain_tx.id].state,
            BlockchainTransactionState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_amount_mismatch_cancels() {
        let f = fixture().await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        f.reader.set_receipt(receipt(HASH, 100, vec![usdt_log(CREATOR, 1_000_000)]));

        let outcome = f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Canceled);
        assert_eq!(
            f.ledger.snapshot().await.transactions[&transaction.id].state,
            TransactionState::Canceled
        );
    }

    #[tokio::test]
    async fn test_missing_receipt_is_not_mined() {
        let f = fixture().await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();

        let err = f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_MINED");
        assert!(err.is_retryable());

        let state = f.ledger.snapshot().await;
        assert_eq!(state.transactions[&transaction.id].state, TransactionState::Pending);
        assert_eq!(
            state.blockchain_transactions[&blockchain_tx.id].state,
            BlockchainTransactionState::Pending
        );
    }

    #[tokio::test]
    async fn test_settled_receipt_is_not_fetched_again() {
        let f = fixture().await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        f.reader.set_receipt(reverted_receipt(HASH, 100));

        f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap();
        assert_eq!(f.reader.receipt_calls(), 1);

        let outcome = f.engine.resolve_receipt(&f.handle, blockchain_tx.id, transaction.id).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Failed);
        assert_eq!(f.reader.receipt_calls(), 1);
    }

    #[tokio::test]
    async fn test_removed_log_touches_nothing() {
        let f = fixture().await;
        let log = LogBuilder::erc20(CONTRACT, CURATOR, CREATOR, TOKEN, "ipfs://QmArticle", 2_500_000)
            .tx_hash(HASH)
            .removed()
            .build();

        let outcome = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Removed);

        let state = f.ledger.snapshot().await;
        assert!(state.blockchain_transactions.is_empty());
        assert!(state.curation_events.is_empty());
        assert!(state.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_contract_log_is_malformed() {
        let f = fixture().await;
        let log = LogBuilder::native(
            address!("0x9999999999999999999999999999999999999999"),
            CURATOR,
            CREATOR,
            "ipfs://QmArticle",
            1,
        )
        .build();

        let outcome = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Malformed);
        assert!(f.ledger.snapshot().await.blockchain_transactions.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_log_is_recorded_without_transaction() {
        let f = fixture().await;
        let log = LogBuilder::erc20(CONTRACT, CURATOR, CREATOR, TOKEN, "ipfs://QmUnknown", 2_500_000)
            .tx_hash(HASH)
            .block(120)
            .build();

        let outcome = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Invalid { reason: InvalidReason::UnknownContent });

        let state = f.ledger.snapshot().await;
        assert_eq!(state.blockchain_transactions.len(), 1);
        assert_eq!(state.curation_events.len(), 1);
        assert!(state.transactions.is_empty());
        let btx = state.blockchain_transactions.values().next().unwrap();
        assert_eq!(btx.state, BlockchainTransactionState::Succeeded);
        assert_eq!(btx.block_number, Some(120));
    }

    #[tokio::test]
    async fn test_unknown_creator_is_invalid() {
        let f = fixture().await;
        let stranger = address!("0x3333333333333333333333333333333333333333");
        let outcome = f
            .engine
            .apply_curation_event(&f.handle, &usdt_log(stranger, 2_500_000))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Invalid { reason: InvalidReason::UnknownCreator });
        assert!(f.ledger.snapshot().await.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_valid_log_settles_matching_pending_transaction() {
        let f = fixture().await;
        let mut tx = f.ledger.begin().await.unwrap();
        let pending = tx
            .create_transaction(pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let outcome = f
            .engine
            .apply_curation_event(&f.handle, &usdt_log(CREATOR, 2_500_000))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Linked { transaction_id: pending.id });

        let state = f.ledger.snapshot().await;
        assert_eq!(state.transactions.len(), 1);
        let stored = &state.transactions[&pending.id];
        assert_eq!(stored.state, TransactionState::Succeeded);
        let btx = state.blockchain_transactions.values().next().unwrap();
        assert_eq!(stored.provider_tx_id, Some(btx.id));
        assert_eq!(btx.transaction_id, Some(pending.id));
    }

    #[tokio::test]
    async fn test_unmatched_log_creates_anonymous_transaction() {
        let f = fixture().await;

        let outcome = f
            .engine
            .apply_curation_event(&f.handle, &usdt_log(CREATOR, 2_500_000))
            .await
            .unwrap();
        let ApplyOutcome::Created { transaction_id } = outcome else {
            panic!("expected a created transaction, got {:?}", outcome);
        };

        let state = f.ledger.snapshot().await;
        assert_eq!(state.transactions.len(), 1);
        let created = &state.transactions[&transaction_id];
        assert_eq!(created.state, TransactionState::Succeeded);
        assert_eq!(created.sender_id, None);
        assert_eq!(created.recipient_id, f.creator_id);
        assert_eq!(created.target_id, Some(f.content_id));
        assert_eq!(created.amount, dec!(2.5));
        assert_eq!(created.currency, "USDT");
    }

    #[tokio::test]
    async fn test_replaying_a_log_is_idempotent() {
        let f = fixture().await;
        let log = usdt_log(CREATOR, 2_500_000);

        let first = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
        let before = f.ledger.snapshot().await;

        let second = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
        let after = f.ledger.snapshot().await;

        let ApplyOutcome::Created { transaction_id } = first else {
            panic!("expected a created transaction, got {:?}", first);
        };
        assert_eq!(second, ApplyOutcome::AlreadySettled { transaction_id });
        assert_eq!(before.transactions, after.transactions);
        assert_eq!(before.blockchain_transactions, after.blockchain_transactions);
        assert_eq!(before.curation_events, after.curation_events);
    }

    #[tokio::test]
    async fn test_log_for_seeded_payment_links_it() {
        let f = fixture().await;
        let (transaction, _) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        f.reader.set_receipt(receipt(HASH, 100, vec![usdt_log(CREATOR, 2_500_000)]));

        let outcome = f
            .engine
            .apply_curation_event(&f.handle, &usdt_log(CREATOR, 2_500_000))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Linked { transaction_id: transaction.id });
        assert_eq!(
            f.ledger.snapshot().await.transactions[&transaction.id].state,
            TransactionState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_replay_does_not_rewrite_sender() {
        let f = fixture().await;
        let log = usdt_log(CREATOR, 2_500_000);
        let ApplyOutcome::Created { transaction_id } =
            f.engine.apply_curation_event(&f.handle, &log).await.unwrap()
        else {
            panic!("expected a created transaction");
        };

        // The curator signs up after the fact; replay does not rewrite history
        f.ledger.add_user(CURATOR).await;
        f.engine.apply_curation_event(&f.handle, &log).await.unwrap();

        assert_eq!(f.ledger.snapshot().await.transactions[&transaction_id].sender_id, None);
    }

    #[tokio::test]
    async fn test_ledger_failure_propagates() {
        let f = fixture().await;
        f.ledger.set_fail_writes(true);
        let err = f
            .engine
            .apply_curation_event(&f.handle, &usdt_log(CREATOR, 2_500_000))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATABASE_ERROR");

        f.ledger.set_fail_writes(false);
        assert!(f.ledger.snapshot().await.blockchain_transactions.is_empty());
    }

    #[tokio::test]
    async fn test_log_underpaying_seeded_payment_cancels_it() {
        let f = fixture().await;
        let (transaction, blockchain_tx) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(5)))
            .await
            .unwrap();
        let log = usdt_log(CREATOR, 1_000_000);
        f.reader.set_receipt(receipt(HASH, 100, vec![log.clone()]));

        let outcome = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Rejected { transaction_id: transaction.id });

        let state = f.ledger.snapshot().await;
        let stored = &state.transactions[&transaction.id];
        assert_eq!(stored.state, TransactionState::Canceled);
        assert_eq!(stored.remark.as_deref(), Some(REMARK_INVALID));
        assert_eq!(
            state.blockchain_transactions[&blockchain_tx.id].state,
            BlockchainTransactionState::Succeeded
        );
        assert_eq!(state.transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_log_for_seeded_payment_cancels_it() {
        let f = fixture().await;
        let (transaction, _) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();
        let log = LogBuilder::erc20(CONTRACT, CURATOR, CREATOR, TOKEN, "ipfs://QmUnknown", 2_500_000)
            .tx_hash(HASH)
            .block(100)
            .build();
        f.reader.set_receipt(receipt(HASH, 100, vec![log.clone()]));

        let outcome = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Rejected { transaction_id: transaction.id });
        assert_eq!(
            f.ledger.snapshot().await.transactions[&transaction.id].state,
            TransactionState::Canceled
        );
    }

    #[tokio::test]
    async fn test_unmined_log_for_seeded_payment_leaves_it_pending() {
        let f = fixture().await;
        let (transaction, _) = f
            .ledger
            .seed_pending_payment(Chain::Optimism, HASH, pending_donation(f.creator_id, f.content_id, dec!(2.5)))
            .await
            .unwrap();

        let err = f
            .engine
            .apply_curation_event(&f.handle, &usdt_log(CREATOR, 2_500_000))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_MINED");
        assert_eq!(
            f.ledger.snapshot().await.transactions[&transaction.id].state,
            TransactionState::Pending
        );
    }

    #[tokio::test]
    async fn test_out_of_range_log_position_is_malformed() {
        let f = fixture().await;
        let huge_block = LogBuilder::erc20(CONTRACT, CURATOR, CREATOR, TOKEN, "ipfs://QmArticle", 2_500_000)
            .tx_hash(HASH)
            .block(u64::MAX)
            .build();
        let huge_index = LogBuilder::erc20(CONTRACT, CURATOR, CREATOR, TOKEN, "ipfs://QmArticle", 2_500_000)
            .tx_hash(HASH)
            .block(100)
            .log_index(u64::MAX)
            .build();

        for log in [huge_block, huge_index] {
            let outcome = f.engine.apply_curation_event(&f.handle, &log).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Malformed);
        }

        let state = f.ledger.snapshot().await;
        assert!(state.blockchain_transactions.is_empty());
        assert!(state.curation_events.is_empty());
        assert!(state.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_receipt_links_unlinked_blockchain_transaction() {
        let f = fixture().await;
        // Observed first with content nobody knows, so nothing was credited
        let invalid = LogBuilder::erc20(CONTRACT, CURATOR, CREATOR, TOKEN, "ipfs://QmUnknown", 2_500_000)
            .tx_hash(HASH)
            .block(100)
            .build();
        f.engine.apply_curation_event(&f.handle, &invalid).await.unwrap();
        let blockchain_tx_id = *f.ledger.snapshot().await.blockchain_transactions.keys().next().unwrap();

        let mut tx = f.ledger.begin().await.unwrap();
        let transaction = tx
            .create_transaction(NewTransaction {
                provider_tx_id: Some(blockchain_tx_id),
                ..pending_donation(f.creator_id, f.content_id, dec!(2.5))
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        f.reader.set_receipt(receipt(HASH, 100, vec![invalid]));

        let outcome = f
            .engine
            .resolve_receipt(&f.handle, blockchain_tx_id, transaction.id)
            .await
            .unwrap();
        assert_eq!(outcome, ReceiptOutcome::Canceled);

        let state = f.ledger.snapshot().await;
        assert_eq!(state.transactions[&transaction.id].state, TransactionState::Canceled);
        assert_eq!(
            state.blockchain_transactions[&blockchain_tx_id].transaction_id,
            Some(transaction.id)
        );
    }

    #[tokio::test]
    async fn test_blockchain_transaction_linked_elsewhere_is_refused() {
        let f = fixture().await;
        let ApplyOutcome::Created { transaction_id: created_id } = f
            .engine
            .apply_curation_event(&f.handle, &usdt_log(CREATOR, 2_500_000))
            .await
            .unwrap()
        else {
            panic!("expected a created transaction");
        };
        let blockchain_tx_id = *f.ledger.snapshot().await.blockchain_transactions.keys().next().unwrap();

        let mut tx = f.ledger.begin().await.unwrap();
        let other = tx
            .create_transaction(NewTransaction {
                provider_tx_id: Some(blockchain_tx_id),
                ..pending_donation(f.creator_id, f.content_id, dec!(2.5))
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = f
            .engine
            .resolve_receipt(&f.handle, blockchain_tx_id, other.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_LINKED");
        assert!(!err.is_retryable());

        let state = f.ledger.snapshot().await;
        assert_eq!(state.transactions[&other.id].state, TransactionState::Pending);
        assert_eq!(state.blockchain_transactions[&blockchain_tx_id].transaction_id, Some(created_id));
        assert_eq!(f.reader.receipt_calls(), 0);
    }
}

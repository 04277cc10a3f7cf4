use crate::error::{AppResult, SettlementError};
use crate::ledger::models::{BlockchainTransactionState, TransactionState};

/// Validate ledger transaction state machine transitions
/// Valid transitions:
/// - Pending → Succeeded, Failed, Canceled
/// - Terminal states (Succeeded, Failed, Canceled) → NO TRANSITIONS ALLOWED
pub fn validate_transaction_transition(
    from: TransactionState,
    to: TransactionState,
) -> AppResult<()> {
    let allowed_transitions = match from {
        TransactionState::Pending => vec![
            TransactionState::Succeeded,
            TransactionState::Failed,
            TransactionState::Canceled,
        ],
        // Terminal states - no transitions allowed
        TransactionState::Succeeded | TransactionState::Failed | TransactionState::Canceled => {
            vec![]
        }
    };

    if !allowed_transitions.contains(&to) {
        return Err(SettlementError::InvalidTransition {
            current: format!("{:?}", from),
            requested: format!("{:?}", to),
        }
        .into());
    }

    Ok(())
}

/// Validate on-chain transaction state machine transitions
/// Valid transitions:
/// - Pending → Reverted, Succeeded
/// - Terminal states (Reverted, Succeeded) → NO TRANSITIONS ALLOWED
pub fn validate_blockchain_transition(
    from: BlockchainTransactionState,
    to: BlockchainTransactionState,
) -> AppResult<()> {
    let allowed_transitions = match from {
        BlockchainTransactionState::Pending => vec![
            BlockchainTransactionState::Reverted,
            BlockchainTransactionState::Succeeded,
        ],
        BlockchainTransactionState::Reverted | BlockchainTransactionState::Succeeded => vec![],
    };

    if !allowed_transitions.contains(&to) {
        return Err(SettlementError::InvalidTransition {
            current: format!("{:?}", from),
            requested: format!("{:?}", to),
        }
        .into());
    }

    Ok(())
}

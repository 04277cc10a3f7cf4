use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, Row, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Chains the curation contract is deployed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Optimism,
    OptimismSepolia,
    Polygon,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Optimism => "optimism",
            Chain::OptimismSepolia => "optimism_sepolia",
            Chain::Polygon => "polygon",
        }
    }

    /// EIP-155 chain id
    pub fn id(&self) -> i64 {
        match self {
            Chain::Optimism => 10,
            Chain::OptimismSepolia => 11_155_420,
            Chain::Polygon => 137,
        }
    }

    pub fn from_id(id: i64) -> Option<Chain> {
        Chain::all().into_iter().find(|chain| chain.id() == id)
    }

    /// Return all supported chains
    pub fn all() -> Vec<Chain> {
        vec![Chain::Optimism, Chain::OptimismSepolia, Chain::Polygon]
    }

    /// Blocks behind the head before a block is treated as reorg-proof
    pub fn default_confirmation_depth(&self) -> u64 {
        match self {
            Chain::Optimism => 50,
            Chain::OptimismSepolia => 25,
            Chain::Polygon => 128,
        }
    }

    pub fn native_symbol(&self) -> &'static str {
        match self {
            Chain::Optimism | Chain::OptimismSepolia => "ETH",
            Chain::Polygon => "POL",
        }
    }
}

impl FromStr for Chain {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse::<i64>() {
            return Chain::from_id(id)
                .ok_or_else(|| AppError::InvalidInput(format!("Unknown chain id: {}", id)));
        }
        match s.to_lowercase().as_str() {
            "optimism" => Ok(Chain::Optimism),
            "optimism_sepolia" | "optimism-sepolia" => Ok(Chain::OptimismSepolia),
            "polygon" => Ok(Chain::Polygon),
            other => Err(AppError::InvalidInput(format!("Unknown chain: {}", other))),
        }
    }
}

/// Payment rail that owns a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_provider", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Blockchain,
    Stripe,
    Internal,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Blockchain => "blockchain",
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Internal => "internal",
        }
    }
}

/// Ledger transaction state
///
/// pending → succeeded | failed | canceled, nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

/// On-chain transaction state
///
/// pending → reverted | succeeded, nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "blockchain_transaction_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BlockchainTransactionState {
    Pending,
    Reverted,
    Succeeded,
}

/// Remark attached to a transaction that was paid on chain but not credited
pub const REMARK_INVALID: &str = "invalid";

pub const PURPOSE_DONATION: &str = "donation";
pub const TARGET_TYPE_ARTICLE: &str = "article";

/// Ledger transaction entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub purpose: String,
    pub provider: PaymentProvider,
    pub provider_tx_id: Option<Uuid>,
    /// None for anonymous payments
    pub sender_id: Option<Uuid>,
    pub recipient_id: Uuid,
    pub target_id: Option<Uuid>,
    pub target_type: Option<String>,
    pub state: TransactionState,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(Transaction {
            id: row.try_get("id")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            purpose: row.try_get("purpose")?,
            provider: row.try_get("provider")?,
            provider_tx_id: row.try_get("provider_tx_id")?,
            sender_id: row.try_get("sender_id")?,
            recipient_id: row.try_get("recipient_id")?,
            target_id: row.try_get("target_id")?,
            target_type: row.try_get("target_type")?,
            state: row.try_get("state")?,
            remark: row.try_get("remark")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.state == TransactionState::Pending
    }
}

/// Fields for a new ledger transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub amount: Decimal,
    pub currency: String,
    pub purpose: String,
    pub provider: PaymentProvider,
    pub provider_tx_id: Option<Uuid>,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Uuid,
    pub target_id: Option<Uuid>,
    pub target_type: Option<String>,
    pub state: TransactionState,
}

/// Criteria for a pending blockchain transaction that an observed event may settle
#[derive(Debug, Clone)]
pub struct PendingMatch {
    pub recipient_id: Uuid,
    pub target_id: Uuid,
    pub currency: String,
    pub amount: Decimal,
}

/// State change for a ledger transaction
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionStateUpdate {
    pub state: TransactionState,
    pub remark: Option<String>,
    /// `Some(None)` clears the sender, `None` leaves it untouched
    pub sender_id: Option<Option<Uuid>>,
}

impl TransactionStateUpdate {
    pub fn to(state: TransactionState) -> Self {
        Self { state, remark: None, sender_id: None }
    }

    pub fn with_remark(mut self, remark: &str) -> Self {
        self.remark = Some(remark.to_string());
        self
    }

    pub fn with_sender(mut self, sender_id: Option<Uuid>) -> Self {
        self.sender_id = Some(sender_id);
        self
    }
}

/// On-chain transaction entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainTransaction {
    pub id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub chain: Chain,
    pub tx_hash: String,
    pub state: BlockchainTransactionState,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub block_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlockchainTransaction {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let chain_id: i64 = row.try_get("chain_id")?;
        let chain = Chain::from_id(chain_id)
            .ok_or_else(|| AppError::Ledger(format!("Unknown chain id in ledger: {}", chain_id)))?;

        Ok(BlockchainTransaction {
            id: row.try_get("id")?,
            transaction_id: row.try_get("transaction_id")?,
            chain,
            tx_hash: row.try_get("tx_hash")?,
            state: row.try_get("state")?,
            from_address: row.try_get("from_address")?,
            to_address: row.try_get("to_address")?,
            block_number: row.try_get("block_number")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state != BlockchainTransactionState::Pending
    }
}

/// Fields for a new on-chain transaction
#[derive(Debug, Clone)]
pub struct NewBlockchainTransaction {
    pub chain: Chain,
    pub tx_hash: String,
    pub transaction_id: Option<Uuid>,
    pub state: BlockchainTransactionState,
    pub block_number: Option<i64>,
}

/// Audit row for one decoded curation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationEventRecord {
    pub blockchain_transaction_id: Uuid,
    pub log_index: i64,
    pub curator_address: String,
    pub creator_address: String,
    /// None for native-coin curation
    pub token_address: Option<String>,
    pub uri: String,
    /// Raw amount in token base units
    pub amount: Decimal,
}

/// Last fully processed block of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub chain: Chain,
    pub block_number: i64,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let chain_id: i64 = row.try_get("chain_id")?;
        let chain = Chain::from_id(chain_id)
            .ok_or_else(|| AppError::Ledger(format!("Unknown chain id in ledger: {}", chain_id)))?;

        Ok(SyncCheckpoint {
            chain,
            block_number: row.try_get("block_number")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

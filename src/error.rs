use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::Chain;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Chain reader error on {chain}: {message}")]
    ChainReader { chain: Chain, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Settlement and reconciliation errors.
///
/// Every variant carries a stable code that the queue and the HTTP surface
/// report verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("Pending transaction {0} not found")]
    TxNotFound(Uuid),

    #[error("Transaction {transaction_id} belongs to provider {provider}, not blockchain")]
    WrongQueue { transaction_id: Uuid, provider: String },

    #[error("Blockchain transaction not found for transaction {0}")]
    BlockchainTxNotFound(Uuid),

    #[error("Blockchain transaction {0} not mined yet")]
    NotMined(String),

    #[error("No chain reader registered for chain {0}")]
    UnsupportedChain(i64),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid state transition: {current} -> {requested}")]
    InvalidTransition { current: String, requested: String },

    #[error("Blockchain transaction {blockchain_tx_id} already settles transaction {linked_to}")]
    LinkedElsewhere { blockchain_tx_id: Uuid, linked_to: Uuid },
}

impl SettlementError {
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::TxNotFound(_) => "TX_NOT_FOUND",
            SettlementError::WrongQueue { .. } => "WRONG_QUEUE",
            SettlementError::BlockchainTxNotFound(_) => "BLOCKCHAIN_TX_NOT_FOUND",
            SettlementError::NotMined(_) => "NOT_MINED",
            SettlementError::UnsupportedChain(_) => "UNSUPPORTED_CHAIN",
            SettlementError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            SettlementError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SettlementError::LinkedElsewhere { .. } => "ALREADY_LINKED",
        }
    }

    /// Only an unmined receipt can resolve itself by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::NotMined(_))
    }
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Ledger(_) => "DATABASE_ERROR",
            AppError::Settlement(e) => e.code(),
            AppError::ChainReader { .. } => "CHAIN_READER_ERROR",
            AppError::Config(_) => "CONFIGURATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidInput(_) => "INVALID_INPUT",
        }
    }

    /// Whether the queue runtime may try the same job again later.
    ///
    /// Infrastructure failures leave the ledger untouched (the ledger
    /// transaction rolls back), so retrying them is safe.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Settlement(e) => e.is_retryable(),
            AppError::Database(_) | AppError::Ledger(_) | AppError::ChainReader { .. } => true,
            _ => false,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Settlement(SettlementError::TxNotFound(_))
            | AppError::Settlement(SettlementError::BlockchainTxNotFound(_))
            | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Settlement(SettlementError::WrongQueue { .. })
            | AppError::Settlement(SettlementError::UnsupportedChain(_))
            | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Settlement(SettlementError::NotMined(_)) => StatusCode::ACCEPTED,
            AppError::Settlement(_) => StatusCode::CONFLICT,
            AppError::ChainReader { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Database details stay in the logs
        let message = match &self {
            AppError::Database(_) | AppError::Ledger(_) => "A database error occurred".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::ledger::models::SyncCheckpoint;

// ========== RESPONSE MODELS ==========

/// Settlement job accepted
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub transaction_id: Uuid,
    /// False when a job for the transaction was already in flight
    pub queued: bool,
}

#[derive(Debug, Serialize)]
pub struct CheckpointResponse {
    pub chain: String,
    pub chain_id: i64,
    pub block_number: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<SyncCheckpoint> for CheckpointResponse {
    fn from(checkpoint: SyncCheckpoint) -> Self {
        Self {
            chain: checkpoint.chain.as_str().to_string(),
            chain_id: checkpoint.chain.id(),
            block_number: checkpoint.block_number,
            updated_at: checkpoint.updated_at,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub settlements_in_flight: usize,
    pub chains: Vec<ChainSyncStatus>,
}

/// Per-chain sync status
#[derive(Debug, Serialize)]
pub struct ChainSyncStatus {
    pub chain: String,
    pub chain_id: i64,
    pub checkpoint: Option<i64>,
}

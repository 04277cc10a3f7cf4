use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    ledger::models::Chain,
    settlement::queue::SettlementQueue,
    sync::{LogSynchronizer, SyncReport},
};

#[derive(Clone)]
pub struct AppState {
    pub queue: SettlementQueue,
    pub synchronizer: Arc<LogSynchronizer>,
}

/// POST /api/v1/settlements/:transaction_id - Queue a settlement job
pub async fn enqueue_settlement(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<EnqueueResponse>)> {
    let queued = state.queue.enqueue(transaction_id);
    info!(%transaction_id, queued, "Settlement requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse { transaction_id, queued }),
    ))
}

/// POST /api/v1/sync/:chain_id - Run one sync cycle now
pub async fn run_sync(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> AppResult<Json<SyncReport>> {
    let chain = Chain::from_str(&chain_id)?;
    info!("Manual sync requested for {}", chain);

    let report = state.synchronizer.run(chain).await?;
    Ok(Json(report))
}

/// GET /api/v1/sync/:chain_id/checkpoint - Current checkpoint of a chain
pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> AppResult<Json<CheckpointResponse>> {
    let chain = Chain::from_str(&chain_id)?;

    let checkpoint = state
        .synchronizer
        .checkpoint(chain)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No checkpoint for {} yet", chain)))?;

    Ok(Json(checkpoint.into()))
}

/// GET /health - Health check
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let mut chains = Vec::new();

    for chain in state.synchronizer.chains() {
        let checkpoint = state.synchronizer.checkpoint(chain).await?;
        chains.push(ChainSyncStatus {
            chain: chain.as_str().to_string(),
            chain_id: chain.id(),
            checkpoint: checkpoint.map(|c| c.block_number),
        });
    }
    chains.sort_by_key(|status| status.chain_id);

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        settlements_in_flight: state.queue.in_flight_count(),
        chains,
    }))
}

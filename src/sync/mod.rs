// Log synchronizer: advances a per-chain checkpoint over confirmed blocks
// and feeds every curation log it finds to the reconciliation engine.
pub mod scheduler;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use self::window::{plan_window, WindowPlan};
use crate::chain::{ChainHandle, ChainRegistry, RawLog};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{Chain, SyncCheckpoint};
use crate::reconcile::{ApplyOutcome, ReconciliationEngine};

/// Logs of one window, ready to apply in order
#[derive(Debug, Clone)]
pub struct FetchedWindow {
    pub plan: WindowPlan,
    pub logs: Vec<RawLog>,
    pub new_checkpoint: u64,
}

/// Per-outcome tallies of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub removed: u64,
    pub malformed: u64,
    pub invalid: u64,
    pub linked: u64,
    pub rejected: u64,
    pub created: u64,
    pub already_settled: u64,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Removed => self.removed += 1,
            ApplyOutcome::Malformed => self.malformed += 1,
            ApplyOutcome::Invalid { .. } => self.invalid += 1,
            ApplyOutcome::Linked { .. } => self.linked += 1,
            ApplyOutcome::Rejected { .. } => self.rejected += 1,
            ApplyOutcome::Created { .. } => self.created += 1,
            ApplyOutcome::AlreadySettled { .. } => self.already_settled += 1,
        }
    }
}

/// Summary of one synchronizer cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub chain: Chain,
    /// Another cycle for the chain was running, nothing was done
    pub busy: bool,
    pub previous_checkpoint: Option<u64>,
    pub new_checkpoint: Option<u64>,
    pub window: Option<WindowPlan>,
    pub logs: u64,
    pub outcomes: OutcomeCounts,
}

impl SyncReport {
    fn busy(chain: Chain) -> Self {
        Self {
            chain,
            busy: true,
            previous_checkpoint: None,
            new_checkpoint: None,
            window: None,
            logs: 0,
            outcomes: OutcomeCounts::default(),
        }
    }
}

pub struct LogSynchronizer {
    engine: ReconciliationEngine,
    chains: Arc<ChainRegistry>,
    /// One run per chain at a time
    running: HashMap<Chain, Arc<Mutex<()>>>,
}

impl LogSynchronizer {
    pub fn new(engine: ReconciliationEngine, chains: Arc<ChainRegistry>) -> Self {
        let running = chains
            .registered_chains()
            .into_iter()
            .map(|chain| (chain, Arc::new(Mutex::new(()))))
            .collect();

        Self { engine, chains, running }
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.chains.registered_chains()
    }

    fn handle(&self, chain: Chain) -> AppResult<&ChainHandle> {
        self.chains
            .get(chain)
            .ok_or_else(|| SettlementError::UnsupportedChain(chain.id()).into())
    }

    /// Stored checkpoint of a chain, `None` before the first cycle
    pub async fn checkpoint(&self, chain: Chain) -> AppResult<Option<SyncCheckpoint>> {
        self.handle(chain)?;
        let mut tx = self.engine.ledger().begin().await?;
        let checkpoint = tx.find_checkpoint(chain).await?;
        Ok(checkpoint)
    }

    /// Pick the window after `checkpoint` and fetch its logs, ordered by
    /// block then log index.
    pub async fn fetch_window(
        &self,
        handle: &ChainHandle,
        checkpoint: Option<u64>,
    ) -> AppResult<FetchedWindow> {
        let current_height = handle.reader.fetch_block_height().await?;
        let plan = plan_window(
            checkpoint,
            current_height,
            handle.config.confirmation_depth,
            handle.config.max_window_size,
        );
        let new_checkpoint = plan.new_checkpoint();

        let Some((from_block, to_block)) = plan.fetch_range() else {
            debug!(current_height, ?checkpoint, "No newly confirmed blocks");
            return Ok(FetchedWindow { plan, logs: Vec::new(), new_checkpoint });
        };

        let fetched = handle.reader.fetch_logs(from_block, to_block).await?;
        let total = fetched.len();

        // The provider default range may run past the safe height; those logs
        // come back in a later window once confirmed
        let mut logs: Vec<RawLog> = fetched
            .into_iter()
            .filter(|log| log.block_number <= new_checkpoint)
            .collect();
        if logs.len() < total {
            debug!(dropped = total - logs.len(), "Dropped logs above the safe height");
        }
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        Ok(FetchedWindow { plan, logs, new_checkpoint })
    }

    /// Run one cycle for a chain.
    ///
    /// The checkpoint only moves after every log of the window was applied,
    /// so an aborted cycle is replayed, never skipped.
    #[instrument(skip(self))]
    pub async fn run(&self, chain: Chain) -> AppResult<SyncReport> {
        let handle = self.handle(chain)?;
        let lock = self
            .running
            .get(&chain)
            .ok_or(SettlementError::UnsupportedChain(chain.id()))?;
        let Ok(_guard) = lock.try_lock() else {
            info!("Sync already running, skipping");
            return Ok(SyncReport::busy(chain));
        };

        let previous_checkpoint = self
            .checkpoint(chain)
            .await?
            .map(|checkpoint| {
                u64::try_from(checkpoint.block_number).map_err(|_| {
                    AppError::Ledger(format!("negative checkpoint {}", checkpoint.block_number))
                })
            })
            .transpose()?;

        let window = self.fetch_window(handle, previous_checkpoint).await?;

        let mut outcomes = OutcomeCounts::default();
        for log in &window.logs {
            let outcome = self.engine.apply_curation_event(handle, log).await?;
            outcomes.record(&outcome);
        }

        if previous_checkpoint != Some(window.new_checkpoint) {
            let block_number = i64::try_from(window.new_checkpoint).map_err(|_| {
                AppError::from(SettlementError::MalformedPayload(format!(
                    "checkpoint {} out of range",
                    window.new_checkpoint
                )))
            })?;
            let mut tx = self.engine.ledger().begin().await?;
            tx.upsert_checkpoint(chain, block_number).await?;
            tx.commit().await?;
        }

        if outcomes.malformed > 0 {
            warn!(malformed = outcomes.malformed, "Skipped malformed curation logs");
        }
        if outcomes.rejected > 0 {
            warn!(rejected = outcomes.rejected, "Canceled transactions the chain did not pay as expected");
        }
        info!(
            ?previous_checkpoint,
            new_checkpoint = window.new_checkpoint,
            logs = window.logs.len(),
            "✓ Sync cycle completed"
        );

        Ok(SyncReport {
            chain,
            busy: false,
            previous_checkpoint,
            new_checkpoint: Some(window.new_checkpoint),
            window: Some(window.plan),
            logs: window.logs.len() as u64,
            outcomes,
        })
    }
}

// Sync Scheduler - runs the log synchronizer for every enabled chain
//
// One background task per chain, ticking every `interval`. A failed cycle is
// logged and the next tick starts over from the stored checkpoint.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use super::LogSynchronizer;
use crate::ledger::models::Chain;

pub struct SyncScheduler {
    synchronizer: Arc<LogSynchronizer>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(synchronizer: Arc<LogSynchronizer>, interval: Duration) -> Self {
        Self { synchronizer, interval }
    }

    /// Start one background loop per registered chain
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.synchronizer
            .chains()
            .into_iter()
            .map(|chain| {
                let synchronizer = self.synchronizer.clone();
                let period = self.interval;
                info!("⏰ Sync scheduled for {} every {}s", chain, period.as_secs());
                tokio::spawn(async move { Self::run_chain_loop(synchronizer, chain, period).await })
            })
            .collect()
    }

    async fn run_chain_loop(synchronizer: Arc<LogSynchronizer>, chain: Chain, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            info!("🔄 Starting sync cycle for {}", chain);
            match synchronizer.run(chain).await {
                Ok(report) if report.busy => {
                    info!("⏭️  Sync for {} still running, tick skipped", chain);
                }
                Ok(report) => {
                    info!(
                        "✓ Sync for {} at block {:?}: {} logs ({} created, {} linked, {} invalid)",
                        chain,
                        report.new_checkpoint,
                        report.logs,
                        report.outcomes.created,
                        report.outcomes.linked,
                        report.outcomes.invalid
                    );
                }
                Err(e) => {
                    error!(code = e.code(), "❌ Sync for {} failed: {}", chain, e);
                }
            }
        }
    }
}

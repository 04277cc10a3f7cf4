// In-process settlement queue
//
// A fixed pool of workers drains one channel. A transaction id stays in the
// in-flight set from enqueue until its job succeeds or is abandoned, which
// covers the time spent waiting for a retry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::SettlementWorker;
use crate::config::QueueConfig;

#[derive(Debug, Clone, Copy)]
struct Job {
    transaction_id: Uuid,
    attempt: u32,
}

/// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
pub fn backoff_delay(config: &QueueConfig, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    config
        .backoff_base
        .checked_mul(factor)
        .unwrap_or(config.backoff_max)
        .min(config.backoff_max)
}

#[derive(Clone)]
pub struct SettlementQueue {
    sender: mpsc::UnboundedSender<Job>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl SettlementQueue {
    /// Spawn the worker pool and return the queue handle
    pub fn start(worker: Arc<SettlementWorker>, config: QueueConfig) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let handles = (0..config.workers.max(1))
            .map(|worker_index| {
                let runner = JobRunner {
                    worker: worker.clone(),
                    config: config.clone(),
                    sender: sender.clone(),
                    in_flight: in_flight.clone(),
                };
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        match job {
                            Some(job) => runner.run(job).await,
                            None => break,
                        }
                    }
                    info!(worker_index, "Settlement worker stopped");
                })
            })
            .collect();

        info!(workers = config.workers.max(1), "🚀 Settlement queue started");
        (Self { sender, in_flight }, handles)
    }

    /// Queue a settlement job. Returns false if a job for the same
    /// transaction is already queued, running or waiting for a retry.
    pub fn enqueue(&self, transaction_id: Uuid) -> bool {
        if !self.in_flight.lock().insert(transaction_id) {
            return false;
        }

        if self.sender.send(Job { transaction_id, attempt: 1 }).is_err() {
            self.in_flight.lock().remove(&transaction_id);
            error!(%transaction_id, "Settlement queue is closed");
            return false;
        }

        true
    }

    pub fn is_in_flight(&self, transaction_id: Uuid) -> bool {
        self.in_flight.lock().contains(&transaction_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

struct JobRunner {
    worker: Arc<SettlementWorker>,
    config: QueueConfig,
    sender: mpsc::UnboundedSender<Job>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl JobRunner {
    async fn run(&self, job: Job) {
        let transaction_id = job.transaction_id;

        match self.worker.settle(transaction_id).await {
            Ok(receipt) => {
                info!(%transaction_id, outcome = ?receipt.outcome, attempt = job.attempt, "Settlement job done");
                self.in_flight.lock().remove(&transaction_id);
            }
            Err(e) if e.is_retryable() && job.attempt < self.config.max_attempts => {
                let delay = backoff_delay(&self.config, job.attempt);
                warn!(
                    %transaction_id,
                    attempt = job.attempt,
                    code = e.code(),
                    delay_ms = delay.as_millis() as u64,
                    "Settlement job will be retried: {}",
                    e
                );

                let sender = self.sender.clone();
                let in_flight = self.in_flight.clone();
                let retry = Job { transaction_id, attempt: job.attempt + 1 };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(retry).is_err() {
                        in_flight.lock().remove(&transaction_id);
                    }
                });
            }
            Err(e) => {
                error!(
                    %transaction_id,
                    attempt = job.attempt,
                    code = e.code(),
                    "❌ Settlement job abandoned: {}",
                    e
                );
                self.in_flight.lock().remove(&transaction_id);
            }
        }
    }
}

use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    chain::{rpc::EvmRpcChainReader, ChainRegistry},
    config::Config,
    error::{AppError, AppResult},
    ledger::repository::LedgerRepository,
    reconcile::ReconciliationEngine,
    settlement::{queue::SettlementQueue, SettlementWorker},
    sync::{scheduler::SyncScheduler, LogSynchronizer},
};

/// Everything `main` needs: the HTTP state and the background tasks
pub struct Application {
    pub state: AppState,
    pub background: Vec<JoinHandle<()>>,
}

pub async fn initialize_app_state(config: &Config) -> AppResult<Application> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(&config.database_url).await?;

    // Core components
    let ledger = Arc::new(LedgerRepository::new(pool));
    let engine = ReconciliationEngine::new(ledger.clone(), ledger.clone());

    info!("⚙️  Initializing chain readers...");

    let mut registry = ChainRegistry::new();
    for chain_config in &config.chains {
        let reader = EvmRpcChainReader::new(
            chain_config.chain,
            &chain_config.rpc_url,
            chain_config.contract_address,
        )?;
        registry.register(chain_config.clone(), Arc::new(reader));
        info!(
            "✅ {} reader registered (depth {}, window {})",
            chain_config.chain, chain_config.confirmation_depth, chain_config.max_window_size
        );
    }

    if config.chains.is_empty() {
        warn!("⚠️  No chains enabled - settlement and sync have nothing to do");
    }

    let registry = Arc::new(registry);
    info!(
        "🔗 Chain registry initialized with chains: {:?}",
        registry.registered_chains()
    );

    // Settlement queue
    let worker = Arc::new(SettlementWorker::new(engine.clone(), registry.clone()));
    let (queue, mut background) = SettlementQueue::start(worker, config.queue.clone());

    // Log synchronizer on a timer
    let synchronizer = Arc::new(LogSynchronizer::new(engine, registry));
    let scheduler = SyncScheduler::new(synchronizer.clone(), config.sync_interval);
    background.extend(scheduler.start());
    info!("✅ Sync scheduler started (every {}s)", config.sync_interval.as_secs());

    Ok(Application {
        state: AppState { queue, synchronizer },
        background,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .map_err(|e| AppError::Config(format!("Cannot connect to database: {}", e)))?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

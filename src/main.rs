use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use curation_settlement::{bootstrap, config::Config, server};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,curation_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting curation settlement service");

    let config = Config::from_env().context("invalid configuration")?;

    let application = bootstrap::initialize_app_state(&config)
        .await
        .context("startup failed")?;

    // Create HTTP server
    let app = server::create_app(application.state).await;

    // Run the server; background tasks are only checked once it stops
    let served = server::run_server(app, &config.bind_address).await;

    for handle in &application.background {
        handle.abort();
    }
    for result in futures::future::join_all(application.background).await {
        if let Err(e) = result {
            if !e.is_cancelled() {
                error!("Background task ended abnormally: {}", e);
            }
        }
    }

    served
}

use dotenvy::dotenv;
use points_ledger::{CoreError, PointsLedger, adapters::PostgresLedgerStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;

use config::WorkerConfig;

// Define a generic error type for the main function
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize tracing (logging), RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Ledger Worker v{}...", env!("CARGO_PKG_VERSION"));

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;

    // --- Database Setup & Migrations ---
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            CoreError::Infrastructure(Box::new(e))
        })?;
    info!("Database connection pool created.");

    let store = PostgresLedgerStore::new(pool);
    if let Err(e) = store.run_migrations().await {
        error!("Database migration failed: {}", e);
        return Err(e.into());
    }
    info!("Database migrations applied.");

    let ledger = PointsLedger::new(Arc::new(store));

    // --- Expiry Sweeper ---
    let start = if config.sweep_on_start {
        Instant::now()
    } else {
        Instant::now() + config.sweep_interval
    };
    let mut ticker = tokio::time::interval_at(start, config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Expiry sweep every {}s (run on start: {})",
        config.sweep_interval.as_secs(),
        config.sweep_on_start
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ledger.expire_points().await {
                    Ok(report) => info!(
                        "Expiry sweep finished: {} batches expired, {} customers failed",
                        report.expired_batches, report.failed_customers
                    ),
                    // The next tick picks up whatever is left
                    Err(e) => error!("Expiry sweep failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping Ledger Worker.");
                break;
            }
        }
    }

    Ok(())
}

use anyhow::Result;
use broker_continuation::MemoryQueue;
use broker_orchestrator::db::{backup_database, create_pool, run_migrations};
use broker_worker::cli::{Args, Command};
use broker_worker::{commands, load_pool_definitions, BrokerService, Config, SimulatedProvider};
use clap::Parser;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = broker_logging::init_subscriber();
    let args = Args::parse();

    info!("Starting broker-worker...");

    // Load configuration, command line wins over the environment
    let mut config = Config::from_env();
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.clone();
    }
    if let Some(pools) = &args.pools {
        config.pool_definitions = Some(pools.clone());
    }
    info!(
        "Configuration loaded: db_path={}, lease_container={}",
        config.db_path.display(),
        config.lease_container
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let pools = Arc::new(load_pool_definitions(&config)?);
    let (queue, receiver) = MemoryQueue::new();
    let service = BrokerService::new(
        &config,
        pool,
        pools,
        Arc::new(SimulatedProvider::default()),
        Arc::new(queue),
    );

    match args.command() {
        Command::Run => commands::run(service, receiver, &config).await,
        Command::Reconcile { settle_secs } => {
            let summary =
                commands::reconcile_once(&service, receiver, Duration::from_secs(settle_secs))
                    .await?;
            service.db.close().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Pools => commands::pools(&service).await,
    }
}

use anyhow::Context;
use speedpay_backend::config::{AppConfig, GatewayMode};
use speedpay_backend::database::PgLedgerStore;
use speedpay_backend::gateway::{HttpPaymentGateway, PaymentGateway, SimulatedGateway};
use speedpay_backend::logging;
use speedpay_backend::queue::{RedisSettlementQueue, SETTLEMENT_TASK};
use speedpay_backend::services::{SettlementDeps, SettlementOrchestrator};
use speedpay_backend::workers::WorkerRuntime;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    if let Err(e) = logging::init_tracing() {
        eprintln!("tracing already initialized: {}", e);
    }

    info!("Starting wallet settlement service");

    let config = AppConfig::load()
        .map_err(|e| {
            error!("Failed to load configuration: {}", e);
            e
        })
        .context("configuration")?;

    let store = PgLedgerStore::connect(&config.database)
        .await
        .context("connecting to postgres")?;
    if config.database.run_migrations {
        store.migrate().await.context("running migrations")?;
    }

    let queue = RedisSettlementQueue::connect(&config.redis)
        .await
        .context("connecting to redis")?;

    let gateway: Arc<dyn PaymentGateway> = match config.gateway.mode {
        GatewayMode::Http => Arc::new(
            HttpPaymentGateway::new(&config.gateway).context("building provider client")?,
        ),
        GatewayMode::Simulated => {
            warn!("Using the simulated payment gateway, no money will move");
            Arc::new(
                SimulatedGateway::new(config.settlement.provider_fee).with_deposit_ttl(
                    chrono::Duration::minutes(config.gateway.deposit_ttl_mins),
                ),
            )
        }
    };

    let queue = Arc::new(queue);
    let orchestrator = Arc::new(SettlementOrchestrator::new(SettlementDeps {
        store: Arc::new(store),
        queue: queue.clone(),
        gateway,
        config: config.settlement.clone(),
    })?);

    let mut runtime = WorkerRuntime::new(queue, config.worker.clone());
    runtime.register_handler(SETTLEMENT_TASK, orchestrator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = tokio::spawn(runtime.run(shutdown_rx));

    info!(app = %config.app.name, "Wallet settlement service started");

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, draining workers");

    shutdown_tx.send(true).ok();
    workers
        .await
        .context("worker pool task")?
        .context("worker pool")?;

    info!("Wallet settlement service stopped");
    Ok(())
}

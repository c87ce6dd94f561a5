//! loghive server binary.
//!
//! Wires the ingestion pipeline together: connects to PostgreSQL and
//! Redis (both fatal on failure, the process never starts degraded),
//! spawns the consumer loop and the HTTP server as independent tasks
//! sharing only the store, then blocks until a termination signal and
//! runs the bounded graceful drain.

use std::error::Error;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info};

use loghive::config::Config;
use loghive::consumer::ConsumerLoop;
use loghive::dlq::RedisDeadLetterQueue;
use loghive::http::HttpServer;
use loghive::queue::RedisQueue;
use loghive::shutdown::ShutdownCoordinator;
use loghive::store::{LogStore, PgLogStore};
use loghive::usecase::{IngestLogUseCase, ListLogsUseCase};
use loghive::LOG_STREAM_NAME;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    let store: Arc<dyn LogStore> = Arc::new(
        PgLogStore::connect(&config.database_url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to database");
                e
            })?,
    );

    let queue = RedisQueue::connect(
        &config.redis_url,
        &config.consumer_group,
        &config.consumer_name,
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to connect to Redis");
        e
    })?;

    info!(
        consumer_group = %config.consumer_group,
        consumer_name = %config.consumer_name,
        "loghive starting"
    );

    // Consumer loop
    let ingest = IngestLogUseCase::new(store.clone());
    let dlq = Arc::new(RedisDeadLetterQueue::new(queue.pool()));
    let subscription = queue.subscribe(LOG_STREAM_NAME);
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(ConsumerLoop::new(ingest, dlq).run(subscription, done_tx));

    // HTTP server
    let list_logs = Arc::new(ListLogsUseCase::new(store));
    let server = HttpServer::bind(&config.http_addr, list_logs)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.http_addr, "Failed to bind HTTP listener");
            e
        })?;
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            error!(error = %e, "HTTP server error");
        }
    });

    info!("Waiting for deliveries; press Ctrl+C to exit");

    let coordinator = ShutdownCoordinator::with_timeout(config.shutdown_timeout);
    coordinator.wait_for_signal().await;

    let outcome = coordinator.drain(&queue, done_rx).await;
    info!(outcome = ?outcome, "Shutdown complete");
    Ok(())
}

//! jobretry demo worker entry point.

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use jobretry_common::config::LoggingConfig;
use jobretry_common::{AppError, Config};
use jobretry_queue::{
    JobRun, LoggingFailureBackend, MemoryQueue, RedisAttemptStore, RetryEngine,
    RetrySuppressionBackend, RetryWorker,
};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, shutting down worker...");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down worker...");
        },
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Process jobs until the task is dropped.
async fn work(worker: &RetryWorker, poll_interval: Duration) {
    loop {
        match worker.perform_next().await {
            Ok(JobRun::Idle) => tokio::time::sleep(poll_interval).await,
            Ok(run) => debug!(?run, "Processed job"),
            Err(e) => {
                let e = AppError::from(e);
                e.log();
                if e.is_transient() {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;
    init_tracing(&config.logging);

    info!("Starting jobretry worker...");

    // Connect to Redis
    info!("Connecting to Redis...");
    let store = RedisAttemptStore::connect(&config.redis.url).await?;
    info!("Connected to Redis");

    // Wire up the retry machinery
    let registry = jobs::registry()?;
    let queue = MemoryQueue::new(registry.clone()).inline(config.worker.inline);
    let engine = RetryEngine::new(Arc::new(store.clone()), Arc::new(queue.clone()));
    let failures = RetrySuppressionBackend::new(Arc::new(store), registry.clone())
        .with_backend(Arc::new(LoggingFailureBackend));
    let identity = config.worker.identity();
    let worker = RetryWorker::new(
        identity.clone(),
        config.worker.queues.clone(),
        registry,
        engine,
        Arc::new(queue.clone()),
        Arc::new(failures),
    );

    jobs::seed(&queue).await?;
    info!(
        worker = %identity,
        queues = ?config.worker.queues,
        inline = config.worker.inline,
        "Worker started"
    );

    let poll_interval = Duration::from_millis(config.worker.poll_interval_ms);
    tokio::select! {
        () = work(&worker, poll_interval) => {},
        () = shutdown_signal() => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}

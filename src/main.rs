//! Cruncher - SSO login statistics
//!
//! Folds the federated login log into:
//! - daily login counts per IdP/SP pair, served as dense time series
//! - a per-user "last service accessed" index
//! - monthly per-service reports labelled by institution

mod aggregator;
mod cleaner;
mod config;
mod db;
mod directory;
mod error;
mod reports;
mod timeseries;
mod web;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::aggregator::Aggregator;
use crate::cleaner::Cleaner;
use crate::db::{Database, EventLog};
use crate::directory::StaticDirectory;
use crate::reports::Reports;
use crate::timeseries::TimeSeriesAssembler;

fn init_logging(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Stop the schedulers, then wait until no run (ours or another instance's)
/// holds the busy flag. A serving error is returned only after that.
async fn wind_down(
    served: Result<()>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    aggregator: &Aggregator,
    timeout: Duration,
) -> Result<()> {
    if let Err(e) = &served {
        error!("Web server stopped with an error: {:#}", e);
    }

    info!("Stopping workers...");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    let drained = aggregator.drain(timeout).await;
    if let Err(e) = &drained {
        error!("Shutdown without draining the aggregator: {}", e);
    }
    served?;
    Ok(drained?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = config::Config::load()?;
    init_logging(&config.logging.level);
    info!("Starting Cruncher...");

    // Aggregate store
    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Aggregate store initialized");

    // Event store: either its own database or a table next to the aggregates
    let events = if config.separate_event_store() {
        let store = Database::open_existing(&config.database.events_url, config.database.max_connections).await?;
        info!("Reading login events from {}", config.database.events_url);
        EventLog::new(store.pool().clone())
    } else {
        db.ensure_event_log().await?;
        EventLog::new(db.pool().clone())
    };
    events.verify().await?;

    let directory = Arc::new(StaticDirectory::load(&config.directory.idp_file));

    // Periodic workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    let aggregator = Arc::new(Aggregator::from_config(db.clone(), events, &config.aggregation));
    if config.aggregation.enabled {
        workers.push(aggregator.clone().spawn(config.aggregation.interval(), shutdown_rx.clone()));
    } else {
        info!("Aggregation disabled (aggregation.enabled=false)");
    }

    let cleaner = Arc::new(Cleaner::new(db.clone(), &config.cleaner));
    workers.push(cleaner.spawn(Duration::from_secs(config.cleaner.interval_secs), shutdown_rx));

    let state = Arc::new(web::AppState {
        db: db.clone(),
        assembler: TimeSeriesAssembler::new(db.clone(), config.query.max_range_days),
        reports: Reports::new(db.clone(), directory),
    });

    // Serve until a shutdown signal arrives; wind down even if serving failed
    let served = web::start_server(&config, state, shutdown_signal()).await;
    wind_down(served, shutdown_tx, workers, &aggregator, config.aggregation.shutdown_timeout()).await?;

    info!("Cruncher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::scratch;
    use chrono::Utc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_server_still_waits_for_the_busy_flag() {
        let (db, events) = scratch().await;
        events.append(&crate::db::LoginEvent::new("u", "idp", "sp", Utc::now())).await.unwrap();
        let aggregator = Arc::new(Aggregator::new(db.clone(), events, 100, Duration::ZERO));

        // A run that is still in flight when serving fails
        assert!(db.try_acquire().await.unwrap());
        let started = std::time::Instant::now();
        let in_flight = {
            let db = db.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                db.release().await.unwrap();
            })
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = vec![aggregator.clone().spawn(Duration::from_secs(3600), shutdown_rx)];

        let served: Result<()> = Err(anyhow::anyhow!("address already in use"));
        let result = wind_down(served, shutdown_tx, workers, &aggregator, Duration::from_secs(10)).await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("address already in use"));
        assert!(started.elapsed() >= Duration::from_millis(400));
        in_flight.await.unwrap();
        assert!(!db.watermark().await.unwrap().busy);
    }

    #[tokio::test]
    async fn wind_down_reports_a_stuck_flag() {
        let (db, events) = scratch().await;
        let aggregator = Aggregator::new(db.clone(), events, 100, Duration::ZERO);
        let (shutdown_tx, _) = watch::channel(false);

        assert!(db.try_acquire().await.unwrap());
        let result = wind_down(Ok(()), shutdown_tx, Vec::new(), &aggregator, Duration::from_millis(300)).await;

        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<crate::error::CruncherError>(), Some(crate::error::CruncherError::StuckLock { .. })));
        assert!(db.watermark().await.unwrap().busy);
    }
}

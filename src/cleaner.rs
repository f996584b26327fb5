//! Retention: drop aggregate rows older than the configured horizon

use chrono::{DateTime, Months, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::CleanerConfig;
use crate::db::{Database, PurgeSummary};
use crate::error::{CruncherError, Result};

pub struct Cleaner {
    db: Database,
    enabled: bool,
    retention_months: u32,
}

impl Cleaner {
    pub fn new(db: Database, config: &CleanerConfig) -> Self {
        Self { db, enabled: config.enabled, retention_months: config.retention_months }
    }

    /// Delete rows dated at or before now minus `retention_months`
    pub async fn run(&self, retention_months: u32) -> Result<PurgeSummary> {
        self.run_at(Utc::now(), retention_months).await
    }

    async fn run_at(&self, now: DateTime<Utc>, retention_months: u32) -> Result<PurgeSummary> {
        let cutoff = now
            .checked_sub_months(Months::new(retention_months))
            .ok_or_else(|| CruncherError::Config(format!("retention of {} months is out of range", retention_months)))?;
        self.db.purge_until(cutoff).await
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_scheduled().await,
                    _ = shutdown.changed() => break,
                }
            }
            info!("Cleaner schedule stopped");
        })
    }

    async fn run_scheduled(&self) {
        if !self.enabled {
            info!("Cleaning disabled (cleaner.enabled=false)");
            return;
        }
        info!("Running database cleanup, retention period is {} month(s)", self.retention_months);
        match self.run(self.retention_months).await {
            Ok(purged) => info!(
                daily_counts = purged.daily_counts,
                last_logins = purged.last_logins,
                unique_logins = purged.unique_logins,
                "Cleanup complete"
            ),
            Err(e) => error!("Cleanup failed: {}", e),
        }
    }
}

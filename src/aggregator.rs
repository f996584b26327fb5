//! Batch aggregation of the raw login log
//!
//! Each run takes the cross-instance busy flag, reads a window of events past
//! the watermark, folds them into `daily_counts`, `last_login` and
//! `unique_logins`, and advances the watermark, all in one transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sqlx::SqliteConnection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::AggregationConfig;
use crate::db::{self, keys, Database, EventLog, LoginEvent, RowState};
use crate::error::{CruncherError, Result};

/// How often `drain` retries the busy flag
const DRAIN_POLL: Duration = Duration::from_millis(250);

/// A skipped run warns once the flag has been held this many intervals
const STUCK_AFTER_INTERVALS: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub events: usize,
    pub daily_inserted: usize,
    pub daily_updated: usize,
    pub last_login_inserted: usize,
    pub last_login_updated: usize,
    pub unique_recorded: usize,
    /// Row folds skipped because the row already reflects the event
    pub already_applied: usize,
    /// Watermark after the run
    pub watermark: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run holds the busy flag
    Skipped,
    Completed(RunSummary),
}

/// Holds the busy flag for one run. Release is explicit; if the guard is
/// dropped without it (cancelled future, panic) the flag is cleared from a
/// spawned task instead.
struct CrunchLock {
    db: Database,
    released: bool,
}

impl CrunchLock {
    async fn acquire(db: &Database) -> Result<Option<Self>> {
        if db.try_acquire().await? {
            Ok(Some(Self { db: db.clone(), released: false }))
        } else {
            Ok(None)
        }
    }

    async fn release(mut self) {
        match self.db.release().await {
            Ok(()) => self.released = true,
            Err(e) => error!("Failed to release busy flag, retrying in background: {}", e),
        }
    }
}

impl Drop for CrunchLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let db = self.db.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = db.release().await {
                        error!("Busy flag left set, manual unlock required: {}", e);
                    }
                });
            }
            Err(_) => error!("Busy flag dropped outside the runtime, manual unlock required"),
        }
    }
}

pub struct Aggregator {
    db: Database,
    events: EventLog,
    batch_size: u32,
    safety_delay: Duration,
}

impl Aggregator {
    pub fn new(db: Database, events: EventLog, batch_size: u32, safety_delay: Duration) -> Self {
        Self { db, events, batch_size, safety_delay }
    }

    pub fn from_config(db: Database, events: EventLog, config: &AggregationConfig) -> Self {
        Self::new(db, events, config.batch_size, config.safety_delay())
    }

    /// One aggregation pass. `Skipped` when another run is active.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        self.run_at(Utc::now()).await
    }

    async fn run_at(&self, now: DateTime<Utc>) -> Result<RunOutcome> {
        let Some(lock) = CrunchLock::acquire(&self.db).await? else {
            debug!("Someone else is crunching, not doing anything");
            return Ok(RunOutcome::Skipped);
        };

        let result = self.crunch(now).await;
        lock.release().await;

        result.map(RunOutcome::Completed)
    }

    async fn crunch(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let position = self.db.watermark().await?.position;
        let cutoff = now - chrono::Duration::from_std(self.safety_delay).unwrap_or_else(|_| chrono::Duration::zero());

        let batch = self.events.unprocessed(position, self.batch_size).await.map_err(aggregation_failure)?;
        let fetched = batch.len();
        let window = within_safety_window(batch, cutoff);
        debug!(
            "Got {} unprocessed login entries after {}, {} inside the safety window",
            fetched,
            position,
            window.len()
        );

        let Some(last) = window.last().map(|e| e.sequence_id) else {
            return Ok(RunSummary { watermark: position, ..RunSummary::default() });
        };

        let mut tx = self.db.begin().await.map_err(aggregation_failure)?;
        let mut summary = fold_batch(&mut tx, &window).await.map_err(aggregation_failure)?;
        db::advance_watermark(&mut tx, last).await.map_err(aggregation_failure)?;
        tx.commit().await.map_err(CruncherError::AggregationFailure)?;

        summary.watermark = last;
        Ok(summary)
    }

    /// Wait until no run holds the busy flag, so shutdown never abandons it set.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.db.try_acquire().await? {
                self.db.release().await?;
                info!("Aggregator drained");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let locked_at = self.db.watermark().await?.locked_at;
                return Err(CruncherError::StuckLock { locked_at });
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Run on a fixed interval until `shutdown` flips
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "Aggregator started (batch_size={}, safety_delay={}s, interval={}s)",
                self.batch_size,
                self.safety_delay.as_secs(),
                interval.as_secs()
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_scheduled(interval).await,
                    _ = shutdown.changed() => break,
                }
            }
            info!("Aggregator schedule stopped");
        })
    }

    async fn run_scheduled(&self, interval: Duration) {
        match self.run_once().await {
            Ok(RunOutcome::Completed(summary)) if summary.events > 0 => {
                info!(
                    events = summary.events,
                    daily_inserted = summary.daily_inserted,
                    daily_updated = summary.daily_updated,
                    last_login_inserted = summary.last_login_inserted,
                    last_login_updated = summary.last_login_updated,
                    already_applied = summary.already_applied,
                    watermark = summary.watermark,
                    "Aggregation run complete"
                );
            }
            Ok(RunOutcome::Completed(_)) => debug!("Aggregation run found nothing to do"),
            Ok(RunOutcome::Skipped) => self.warn_if_stuck(interval).await,
            Err(e) => error!("Aggregation run failed, retrying next tick: {}", e),
        }
    }

    async fn warn_if_stuck(&self, interval: Duration) {
        let Ok(status) = self.db.watermark().await else { return };
        let Some(locked_at) = status.locked_at else { return };
        let held_ms = Utc::now().timestamp_millis() - locked_at;
        if held_ms > (interval * STUCK_AFTER_INTERVALS).as_millis() as i64 {
            warn!(
                "Busy flag held for {}s; if no aggregator is running it is stuck and needs an admin unlock",
                held_ms / 1000
            );
        }
    }
}

fn aggregation_failure(err: CruncherError) -> CruncherError {
    match err {
        CruncherError::Database(e) => CruncherError::AggregationFailure(e),
        other => other,
    }
}

/// Keep events up to the first one newer than `cutoff`. Stops there even if
/// later sequence ids are older, so the watermark never passes an unread event.
fn within_safety_window(batch: Vec<LoginEvent>, cutoff: DateTime<Utc>) -> Vec<LoginEvent> {
    batch.into_iter().take_while(|e| e.login_timestamp <= cutoff).collect()
}

/// Fold events (in sequence order) into the aggregate rows
async fn fold_batch(conn: &mut SqliteConnection, events: &[LoginEvent]) -> Result<RunSummary> {
    let mut summary = RunSummary { events: events.len(), ..RunSummary::default() };

    for event in events {
        let key = keys::daily_key(event.day(), &event.idp_entity_id, &event.sp_entity_id);
        match db::daily_count_state(conn, &key).await? {
            RowState::Missing => {
                trace!("Inserting aggregated record for {}, record: {:?}", event.day(), event);
                db::insert_daily_count(conn, &key, event).await?;
                summary.daily_inserted += 1;
            }
            RowState::AppliedUpTo(seq) if seq < event.sequence_id => {
                trace!("Updating aggregated record for {}, record: {:?}", event.day(), event);
                db::increment_daily_count(conn, &key, event.sequence_id).await?;
                summary.daily_updated += 1;
            }
            RowState::AppliedUpTo(_) => summary.already_applied += 1,
        }

        let key = keys::last_login_key(&event.user_id, &event.sp_entity_id);
        match db::last_login_state(conn, &key).await? {
            RowState::Missing => {
                db::insert_last_login(conn, &key, event).await?;
                summary.last_login_inserted += 1;
            }
            RowState::AppliedUpTo(seq) if seq < event.sequence_id => {
                db::overwrite_last_login(conn, &key, event).await?;
                summary.last_login_updated += 1;
            }
            RowState::AppliedUpTo(_) => summary.already_applied += 1,
        }

        if db::record_unique_login(conn, event).await? {
            summary.unique_recorded += 1;
        }
    }

    Ok(summary)
}

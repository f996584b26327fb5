//! Database module
//!
//! The aggregate store: `daily_counts`, `last_login`, `unique_logins` and the
//! single-row `watermark`. Row-level fold primitives take a bare connection so
//! the aggregator can run a whole batch inside one transaction.

mod event_log;
pub mod keys;
mod schema;

pub use event_log::{EventLog, LoginEvent};

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Stored daily aggregate, as read back for reports
#[derive(Debug, Clone, PartialEq)]
pub struct DailyCount {
    pub day: NaiveDate,
    pub idp_entity_id: String,
    pub idp_entity_name: Option<String>,
    pub sp_entity_id: String,
    pub sp_entity_name: Option<String>,
    pub entry_count: i64,
}

/// A service the user has logged in to, with the last time seen
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveService {
    pub sp_entity_id: String,
    pub sp_name: Option<String>,
    /// Epoch millis
    pub entry_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkStatus {
    pub position: i64,
    pub busy: bool,
    pub locked_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeSummary {
    pub daily_counts: u64,
    pub last_logins: u64,
    pub unique_logins: u64,
}

/// Sequence id already folded into an aggregate row, if the row exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Missing,
    AppliedUpTo(i64),
}

type DailyRow = (NaiveDate, String, Option<String>, String, Option<String>, i64);

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        Self::open(&config.url, config.max_connections).await
    }

    pub async fn open(path: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            // WAL lets report queries run while a batch commits
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Open a database someone else owns: it must already exist, and its
    /// journal mode is left as the owner set it.
    pub async fn open_existing(path: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?.create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for statement in schema::AGGREGATE_STORE {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Create the raw login table when this database doubles as the event store
    pub async fn ensure_event_log(&self) -> Result<()> {
        sqlx::query(schema::CREATE_LOG_LOGINS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // === WATERMARK / BUSY FLAG ===

    /// Check-and-set busy 0 -> 1. Returns false if another run holds it.
    pub async fn try_acquire(&self) -> Result<bool> {
        let result = sqlx::query("UPDATE watermark SET busy = 1, locked_at = ? WHERE id = 1 AND busy = 0")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release(&self) -> Result<()> {
        sqlx::query("UPDATE watermark SET busy = 0, locked_at = NULL WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn watermark(&self) -> Result<WatermarkStatus> {
        let (position, busy, locked_at): (i64, i64, Option<i64>) =
            sqlx::query_as("SELECT position, busy, locked_at FROM watermark WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(WatermarkStatus { position, busy: busy != 0, locked_at })
    }

    // === READ PATH ===

    /// Daily rows in [start, end] ordered by (idp, sp, day); either filter may be None
    pub async fn daily_counts_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        idp_entity_id: Option<&str>,
        sp_entity_id: Option<&str>,
    ) -> Result<Vec<DailyCount>> {
        let rows: Vec<DailyRow> = sqlx::query_as(
            r#"
            SELECT entry_day, idp_entity_id, idp_entity_name, sp_entity_id, sp_entity_name, entry_count
            FROM daily_counts
            WHERE entry_day >= ? AND entry_day <= ?
              AND (? IS NULL OR idp_entity_id = ?)
              AND (? IS NULL OR sp_entity_id = ?)
            ORDER BY idp_entity_id, sp_entity_id, entry_day
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(idp_entity_id)
        .bind(idp_entity_id)
        .bind(sp_entity_id)
        .bind(sp_entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(day, idp_entity_id, idp_entity_name, sp_entity_id, sp_entity_name, entry_count)| DailyCount {
                day,
                idp_entity_id,
                idp_entity_name,
                sp_entity_id,
                sp_entity_name,
                entry_count,
            })
            .collect())
    }

    pub async fn active_services(&self, user_id: &str, idp_entity_id: &str) -> Result<Vec<ActiveService>> {
        let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
            "SELECT sp_entity_id, sp_entity_name, login_stamp FROM last_login WHERE user_id = ? AND idp_entity_id = ?",
        )
        .bind(user_id)
        .bind(idp_entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(sp_entity_id, sp_name, entry_time)| ActiveService { sp_entity_id, sp_name, entry_time })
            .collect())
    }

    /// Login totals per idp for one sp over [start, end)
    pub async fn sp_logins_per_idp(&self, sp_entity_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT idp_entity_id, SUM(entry_count) AS total
            FROM daily_counts
            WHERE sp_entity_id = ? AND entry_day >= ? AND entry_day < ?
            GROUP BY idp_entity_id
            ORDER BY idp_entity_id
            "#,
        )
        .bind(sp_entity_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn unique_users(&self, sp_entity_id: &str, month: NaiveDate) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT user_id) FROM unique_logins WHERE entry_month = ? AND sp_entity_id = ?",
        )
        .bind(month)
        .bind(sp_entity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // === RETENTION ===

    /// Delete rows at or before `cutoff`. Unique-login months go once they end before the cutoff month.
    pub async fn purge_until(&self, cutoff: DateTime<Utc>) -> Result<PurgeSummary> {
        let cutoff_day = cutoff.date_naive();
        let cutoff_month = first_of_month(cutoff_day);

        let daily_counts = sqlx::query("DELETE FROM daily_counts WHERE entry_day <= ?")
            .bind(cutoff_day)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let last_logins = sqlx::query("DELETE FROM last_login WHERE login_stamp <= ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        let unique_logins = sqlx::query("DELETE FROM unique_logins WHERE entry_month < ?")
            .bind(cutoff_month)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(PurgeSummary { daily_counts, last_logins, unique_logins })
    }
}

pub fn first_of_month(day: NaiveDate) -> NaiveDate {
    day.with_day0(0).unwrap_or(day)
}


// === FOLD PRIMITIVES (run inside the batch transaction) ===

pub async fn daily_count_state(conn: &mut SqliteConnection, key: &str) -> Result<RowState> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_sequence_id FROM daily_counts WHERE key_hash = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map_or(RowState::Missing, |(seq,)| RowState::AppliedUpTo(seq)))
}

pub async fn insert_daily_count(conn: &mut SqliteConnection, key: &str, event: &LoginEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_counts (key_hash, entry_day, idp_entity_id, idp_entity_name, sp_entity_id, sp_entity_name, entry_count, last_sequence_id)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(key)
    .bind(event.day())
    .bind(&event.idp_entity_id)
    .bind(&event.idp_entity_name)
    .bind(&event.sp_entity_id)
    .bind(&event.sp_entity_name)
    .bind(event.sequence_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn increment_daily_count(conn: &mut SqliteConnection, key: &str, sequence_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE daily_counts SET entry_count = entry_count + 1, last_sequence_id = ? WHERE key_hash = ? AND last_sequence_id < ?",
    )
    .bind(sequence_id)
    .bind(key)
    .bind(sequence_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn last_login_state(conn: &mut SqliteConnection, key: &str) -> Result<RowState> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_sequence_id FROM last_login WHERE key_hash = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map_or(RowState::Missing, |(seq,)| RowState::AppliedUpTo(seq)))
}

pub async fn insert_last_login(conn: &mut SqliteConnection, key: &str, event: &LoginEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO last_login (key_hash, user_id, idp_entity_id, idp_entity_name, sp_entity_id, sp_entity_name, login_stamp, last_sequence_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(key)
    .bind(&event.user_id)
    .bind(&event.idp_entity_id)
    .bind(&event.idp_entity_name)
    .bind(&event.sp_entity_id)
    .bind(&event.sp_entity_name)
    .bind(event.login_timestamp.timestamp_millis())
    .bind(event.sequence_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn overwrite_last_login(conn: &mut SqliteConnection, key: &str, event: &LoginEvent) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE last_login
        SET idp_entity_id = ?,
            idp_entity_name = ?,
            sp_entity_name = COALESCE(?, sp_entity_name),
            login_stamp = ?,
            last_sequence_id = ?
        WHERE key_hash = ? AND last_sequence_id < ?
        "#,
    )
    .bind(&event.idp_entity_id)
    .bind(&event.idp_entity_name)
    .bind(&event.sp_entity_name)
    .bind(event.login_timestamp.timestamp_millis())
    .bind(event.sequence_id)
    .bind(key)
    .bind(event.sequence_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record (month, user, sp, idp); returns true if this is the first sighting
pub async fn record_unique_login(conn: &mut SqliteConnection, event: &LoginEvent) -> Result<bool> {
    let month = first_of_month(event.day());
    let key = keys::unique_login_key(month, &event.user_id, &event.sp_entity_id, &event.idp_entity_id);
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO unique_logins (key_hash, entry_month, user_id, idp_entity_id, sp_entity_id, last_sequence_id)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(key)
    .bind(month)
    .bind(&event.user_id)
    .bind(&event.idp_entity_id)
    .bind(&event.sp_entity_id)
    .bind(event.sequence_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn advance_watermark(conn: &mut SqliteConnection, position: i64) -> Result<()> {
    sqlx::query("UPDATE watermark SET position = ? WHERE id = 1")
        .bind(position)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

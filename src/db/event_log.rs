//! Read side of the raw login log
//!
//! The log is owned by the SSO proxy; we only read past the watermark.
//! `append` exists for local feeding and tests.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};

use tracing::error;

use crate::error::{CruncherError, Result};

/// A single federated login, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginEvent {
    pub sequence_id: i64,
    pub idp_entity_id: String,
    pub idp_entity_name: Option<String>,
    pub sp_entity_id: String,
    pub sp_entity_name: Option<String>,
    pub user_id: String,
    pub login_timestamp: DateTime<Utc>,
}

impl LoginEvent {
    /// Build an event that has not been assigned a sequence position yet
    pub fn new(user_id: &str, idp_entity_id: &str, sp_entity_id: &str, login_timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence_id: 0,
            idp_entity_id: idp_entity_id.to_string(),
            idp_entity_name: None,
            sp_entity_id: sp_entity_id.to_string(),
            sp_entity_name: None,
            user_id: user_id.to_string(),
            login_timestamp,
        }
    }

    pub fn with_names(mut self, idp_entity_name: &str, sp_entity_name: &str) -> Self {
        self.idp_entity_name = Some(idp_entity_name.to_string());
        self.sp_entity_name = Some(sp_entity_name.to_string());
        self
    }

    /// UTC day bucket
    pub fn day(&self) -> NaiveDate {
        self.login_timestamp.date_naive()
    }
}

type LoginRow = (i64, i64, String, String, Option<String>, String, Option<String>);

#[derive(Clone)]
pub struct EventLog {
    pool: Pool<Sqlite>,
}

impl EventLog {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Up to `limit` events strictly after `after`, in sequence order
    pub async fn unprocessed(&self, after: i64, limit: u32) -> Result<Vec<LoginEvent>> {
        let rows: Vec<LoginRow> = sqlx::query_as(
            r#"
            SELECT sequence_id, login_stamp, user_id, idp_entity_id, idp_entity_name, sp_entity_id, sp_entity_name
            FROM log_logins
            WHERE sequence_id > ?
            ORDER BY sequence_id ASC
            LIMIT ?
            "#,
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(sequence_id, stamp, user_id, idp_entity_id, idp_entity_name, sp_entity_id, sp_entity_name)| -> Result<LoginEvent> {
                let login_timestamp = DateTime::from_timestamp_millis(stamp).ok_or_else(|| {
                    error!("Login event {} has an unrepresentable login_stamp {}", sequence_id, stamp);
                    sqlx::Error::Decode(format!("login_stamp {} of event {} is out of range", stamp, sequence_id).into())
                })?;
                Ok(LoginEvent {
                    sequence_id,
                    idp_entity_id,
                    idp_entity_name,
                    sp_entity_id,
                    sp_entity_name,
                    user_id,
                    login_timestamp,
                })
            })
            .collect()
    }

    /// Fail fast when the configured event store has no login log
    pub async fn verify(&self) -> Result<()> {
        let (tables,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'log_logins'")
                .fetch_one(&self.pool)
                .await?;
        if tables == 0 {
            return Err(CruncherError::Config("event store has no log_logins table".to_string()));
        }
        Ok(())
    }

    /// Append an event and return its assigned sequence id
    pub async fn append(&self, event: &LoginEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO log_logins (login_stamp, user_id, idp_entity_id, idp_entity_name, sp_entity_id, sp_entity_name)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.login_timestamp.timestamp_millis())
        .bind(&event.user_id)
        .bind(&event.idp_entity_id)
        .bind(&event.idp_entity_name)
        .bind(&event.sp_entity_id)
        .bind(&event.sp_entity_name)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }
}

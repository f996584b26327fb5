//! Dense daily series from the sparse `daily_counts` rows
//!
//! Rows arrive sorted by (idp, sp, day). A single pass carries the open
//! group; a key change closes it, and the end of input closes the last one.

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;

use crate::db::{DailyCount, Database};
use crate::error::{CruncherError, Result};

pub const POINT_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// One (idp, sp) pair over the requested range, one slot per day
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginSeries {
    pub idp_entity_id: String,
    pub idp_name: Option<String>,
    pub sp_entity_id: String,
    pub sp_name: Option<String>,
    pub total: i64,
    pub point_start: i64,
    pub point_end: i64,
    pub point_interval: i64,
    pub data: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesQuery {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub idp_entity_id: Option<String>,
    pub sp_entity_id: Option<String>,
}

impl SeriesQuery {
    /// Blank filters count as absent
    pub fn new(start: NaiveDate, end: NaiveDate, idp_entity_id: Option<String>, sp_entity_id: Option<String>) -> Self {
        Self {
            start,
            end,
            idp_entity_id: idp_entity_id.filter(|s| !s.trim().is_empty()),
            sp_entity_id: sp_entity_id.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn validate(&self, max_range_days: i64) -> Result<()> {
        if self.idp_entity_id.is_none() && self.sp_entity_id.is_none() {
            return Err(CruncherError::invalid_query("either idpEntityId or spEntityId is required"));
        }
        if self.end < self.start {
            return Err(CruncherError::invalid_query("endDate is before startDate"));
        }
        if self.days() > max_range_days {
            return Err(CruncherError::invalid_query(format!(
                "range of {} days exceeds the maximum of {}",
                self.days(),
                max_range_days
            )));
        }
        Ok(())
    }

    fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Clone)]
pub struct TimeSeriesAssembler {
    db: Database,
    max_range_days: i64,
}

impl TimeSeriesAssembler {
    pub fn new(db: Database, max_range_days: i64) -> Self {
        Self { db, max_range_days }
    }

    pub async fn query(&self, query: &SeriesQuery) -> Result<Vec<LoginSeries>> {
        query.validate(self.max_range_days)?;
        let rows = self
            .db
            .daily_counts_between(
                query.start,
                query.end,
                query.idp_entity_id.as_deref(),
                query.sp_entity_id.as_deref(),
            )
            .await?;
        Ok(assemble(rows, query.start, query.end))
    }
}

/// Where a row lands relative to the group currently open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    NewGroup,
    SameGroup,
}

struct OpenSeries {
    idp_entity_id: String,
    idp_name: Option<String>,
    sp_entity_id: String,
    sp_name: Option<String>,
    data: Vec<i64>,
}

impl OpenSeries {
    fn start(row: &DailyCount, days: usize) -> Self {
        Self {
            idp_entity_id: row.idp_entity_id.clone(),
            idp_name: row.idp_entity_name.clone(),
            sp_entity_id: row.sp_entity_id.clone(),
            sp_name: row.sp_entity_name.clone(),
            data: vec![0; days],
        }
    }

    fn step(open: Option<&Self>, row: &DailyCount) -> Step {
        match open {
            Some(s) if s.idp_entity_id == row.idp_entity_id && s.sp_entity_id == row.sp_entity_id => Step::SameGroup,
            _ => Step::NewGroup,
        }
    }

    fn fill(&mut self, row: &DailyCount, start: NaiveDate) {
        let offset = (row.day - start).num_days();
        if let Some(slot) = usize::try_from(offset).ok().and_then(|i| self.data.get_mut(i)) {
            *slot += row.entry_count;
        }
    }

    fn close(self, start: NaiveDate, end: NaiveDate) -> LoginSeries {
        LoginSeries {
            total: self.data.iter().sum(),
            idp_entity_id: self.idp_entity_id,
            idp_name: self.idp_name,
            sp_entity_id: self.sp_entity_id,
            sp_name: self.sp_name,
            point_start: midnight_millis(start),
            point_end: midnight_millis(end),
            point_interval: POINT_INTERVAL_MS,
            data: self.data,
        }
    }
}

fn midnight_millis(day: NaiveDate) -> i64 {
    day.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Group rows sorted by (idp, sp, day) into dense series over [start, end]
pub fn assemble(rows: impl IntoIterator<Item = DailyCount>, start: NaiveDate, end: NaiveDate) -> Vec<LoginSeries> {
    let days = usize::try_from((end - start).num_days() + 1).unwrap_or(0);

    let (mut closed, open) = rows.into_iter().fold(
        (Vec::new(), None::<OpenSeries>),
        |(mut closed, open), row| {
            let mut current = match OpenSeries::step(open.as_ref(), &row) {
                Step::SameGroup => open,
                Step::NewGroup => {
                    if let Some(previous) = open {
                        closed.push(previous.close(start, end));
                    }
                    Some(OpenSeries::start(&row, days))
                }
            };
            if let Some(series) = current.as_mut() {
                series.fill(&row, start);
            }
            (closed, current)
        },
    );

    // Last group (and the one-row case) closes at end of input
    if let Some(last) = open {
        closed.push(last.close(start, end));
    }
    closed
}

//! Per-user recent activity and the monthly per-service report

use chrono::{Months, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::{first_of_month, ActiveService, Database};
use crate::directory::SharedDirectory;
use crate::error::{CruncherError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReport {
    pub total_login_count: i64,
    pub unique_login_count: i64,
    /// Logins per institution; idps unknown to the directory are counted under ""
    pub institution_counts: BTreeMap<String, i64>,
}

#[derive(Clone)]
pub struct Reports {
    db: Database,
    directory: SharedDirectory,
}

impl Reports {
    pub fn new(db: Database, directory: SharedDirectory) -> Self {
        Self { db, directory }
    }

    /// Services the user reached through this idp, with the last time seen. Unordered.
    pub async fn active_services(&self, user_id: &str, idp_entity_id: &str) -> Result<Vec<ActiveService>> {
        if user_id.trim().is_empty() {
            return Err(CruncherError::invalid_query("userId is a required query parameter"));
        }
        if idp_entity_id.trim().is_empty() {
            return Err(CruncherError::invalid_query("idpEntityId is a required query parameter"));
        }
        self.db.active_services(user_id, idp_entity_id).await
    }

    pub async fn monthly_report(&self, year: i32, month: u32, sp_entity_id: &str) -> Result<MonthlyReport> {
        if sp_entity_id.trim().is_empty() {
            return Err(CruncherError::invalid_query("spEntityId is a required query parameter"));
        }
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| CruncherError::invalid_query(format!("no such month: {}-{}", year, month)))?;
        let end = start
            .checked_add_months(Months::new(1))
            .ok_or_else(|| CruncherError::invalid_query("month out of range"))?;

        let per_idp = self.db.sp_logins_per_idp(sp_entity_id, start, end).await?;
        let unique_login_count = self.db.unique_users(sp_entity_id, first_of_month(start)).await?;

        let mut report = MonthlyReport { unique_login_count, ..MonthlyReport::default() };
        for (idp_entity_id, count) in per_idp {
            let institution = self.directory.institution_id(&idp_entity_id).unwrap_or_default();
            *report.institution_counts.entry(institution).or_insert(0) += count;
            report.total_login_count += count;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, RunOutcome};
    use crate::db::testing::{insert_daily, scratch};
    use crate::db::LoginEvent;
    use crate::directory::StaticDirectory;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn directory() -> SharedDirectory {
        Arc::new(StaticDirectory::from_pairs([("idp-a", "UNI-A"), ("idp-a2", "UNI-A"), ("idp-b", "UNI-B")]))
    }

    #[tokio::test]
    async fn monthly_report_groups_by_institution() {
        let (db, _) = scratch().await;
        let d = |m, n| NaiveDate::from_ymd_opt(2013, m, n).unwrap();
        insert_daily(&db, d(3, 1), "idp-a", "sp", 10).await;
        insert_daily(&db, d(3, 31), "idp-a2", "sp", 5).await;
        insert_daily(&db, d(3, 15), "idp-b", "sp", 7).await;
        insert_daily(&db, d(3, 15), "idp-unknown", "sp", 2).await;
        // Outside the month or for another sp
        insert_daily(&db, d(4, 1), "idp-a", "sp", 100).await;
        insert_daily(&db, d(2, 28), "idp-a", "sp", 100).await;
        insert_daily(&db, d(3, 15), "idp-a", "other-sp", 100).await;

        let reports = Reports::new(db, directory());
        let report = reports.monthly_report(2013, 3, "sp").await.unwrap();

        assert_eq!(report.total_login_count, 24);
        assert_eq!(report.institution_counts.get("UNI-A"), Some(&15));
        assert_eq!(report.institution_counts.get("UNI-B"), Some(&7));
        assert_eq!(report.institution_counts.get(""), Some(&2));
    }

    #[tokio::test]
    async fn monthly_report_counts_distinct_users() {
        let (db, events) = scratch().await;
        let ts = |d, h| Utc.with_ymd_and_hms(2013, 3, d, h, 0, 0).unwrap();
        for (user, day) in [("u1", 1), ("u1", 2), ("u2", 2), ("u3", 30)] {
            events.append(&LoginEvent::new(user, "idp-a", "sp", ts(day, 8))).await.unwrap();
        }
        events
            .append(&LoginEvent::new("u4", "idp-a", "sp", Utc.with_ymd_and_hms(2013, 4, 1, 0, 0, 0).unwrap()))
            .await
            .unwrap();

        let aggregator = Aggregator::new(db.clone(), events, 100, Duration::ZERO);
        assert!(matches!(aggregator.run_once().await.unwrap(), RunOutcome::Completed(_)));

        let report = Reports::new(db, directory()).monthly_report(2013, 3, "sp").await.unwrap();
        assert_eq!(report.unique_login_count, 3);
        assert_eq!(report.total_login_count, 4);
    }

    #[tokio::test]
    async fn monthly_report_rejects_bad_month() {
        let (db, _) = scratch().await;
        let reports = Reports::new(db, directory());
        assert!(matches!(reports.monthly_report(2013, 13, "sp").await, Err(CruncherError::InvalidQuery(_))));
        assert!(matches!(reports.monthly_report(2013, 1, "").await, Err(CruncherError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn active_services_lists_last_login_per_sp() {
        let (db, events) = scratch().await;
        let ts = |h| Utc.with_ymd_and_hms(2013, 6, 1, h, 0, 0).unwrap();
        for (user, idp, sp, h) in [
            ("u1", "idp-a", "sp-1", 8),
            ("u1", "idp-a", "sp-1", 9),
            ("u1", "idp-a", "sp-2", 10),
            ("u1", "idp-b", "sp-3", 11),
            ("u2", "idp-a", "sp-1", 12),
        ] {
            let event = LoginEvent::new(user, idp, sp, ts(h)).with_names(idp, &format!("{} name", sp));
            events.append(&event).await.unwrap();
        }
        let aggregator = Aggregator::new(db.clone(), events, 100, Duration::ZERO);
        aggregator.run_once().await.unwrap();

        let reports = Reports::new(db, directory());
        let mut services = reports.active_services("u1", "idp-a").await.unwrap();
        services.sort_by(|a, b| a.sp_entity_id.cmp(&b.sp_entity_id));

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].sp_entity_id, "sp-1");
        assert_eq!(services[0].sp_name.as_deref(), Some("sp-1 name"));
        assert_eq!(services[0].entry_time, ts(9).timestamp_millis());
        assert_eq!(services[1].sp_entity_id, "sp-2");

        assert!(reports.active_services("nobody", "idp-a").await.unwrap().is_empty());
        assert!(matches!(reports.active_services("", "idp-a").await, Err(CruncherError::InvalidQuery(_))));
    }
}

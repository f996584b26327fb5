//! HTTP routes

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cached::proc_macro::cached;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use std::sync::Arc;

use super::AppState;
use crate::db::{ActiveService, WatermarkStatus};
use crate::error::CruncherError;
use crate::reports::{MonthlyReport, Reports};
use crate::timeseries::{LoginSeries, SeriesQuery};

/// Maps domain errors onto HTTP; only InvalidQuery reaches the client verbatim
pub struct ApiError(CruncherError);

impl From<CruncherError> for ApiError {
    fn from(err: CruncherError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            CruncherError::InvalidQuery(msg) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg }))).into_response()
            }
            other => {
                tracing::error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": "internal error" }))).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginsQuery {
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub idp_entity_id: Option<String>,
    pub sp_entity_id: Option<String>,
}

/// Epoch millis -> UTC calendar day
fn day_param(millis: Option<i64>, name: &str) -> Result<NaiveDate, CruncherError> {
    let millis = millis.ok_or_else(|| CruncherError::invalid_query(format!("{} is a required query parameter", name)))?;
    DateTime::from_timestamp_millis(millis)
        .map(|ts| ts.date_naive())
        .ok_or_else(|| CruncherError::invalid_query(format!("{} is out of range", name)))
}

/// API: daily login series per idp/sp pair
pub async fn api_logins(State(state): State<Arc<AppState>>, Query(query): Query<LoginsQuery>) -> ApiResult<Vec<LoginSeries>> {
    let start = day_param(query.start_date, "startDate")?;
    let end = day_param(query.end_date, "endDate")?;
    let query = SeriesQuery::new(start, end, query.idp_entity_id, query.sp_entity_id);

    let series = state.assembler.query(&query).await?;
    tracing::debug!(
        "Returning {} series for sp {:?} and idp {:?}",
        series.len(),
        query.sp_entity_id,
        query.idp_entity_id
    );
    Ok(Json(series))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastLoginQuery {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub idp_entity_id: String,
}

/// API: services a user recently logged in to
pub async fn api_last_login(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LastLoginQuery>,
) -> ApiResult<Vec<ActiveService>> {
    let services = state.reports.active_services(&query.user_id, &query.idp_entity_id).await?;
    Ok(Json(services))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersStatsQuery {
    pub month: Option<u32>,
    pub year: Option<i32>,
    #[serde(default)]
    pub sp_entity_id: String,
}

/// Cached monthly report - 5 minute TTL
#[cached(
    time = 300,
    result = true,
    key = "(i32, u32, String)",
    convert = r#"{ (year, month, sp_entity_id.clone()) }"#
)]
async fn get_cached_monthly_report(
    year: i32,
    month: u32,
    sp_entity_id: String,
    reports: Reports,
) -> Result<MonthlyReport, CruncherError> {
    reports.monthly_report(year, month, &sp_entity_id).await
}

/// API: monthly login report for one service (cached for 5 minutes)
pub async fn api_vers_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VersStatsQuery>,
) -> ApiResult<MonthlyReport> {
    let month = query.month.ok_or_else(|| CruncherError::invalid_query("month is a required query parameter"))?;
    let year = query.year.ok_or_else(|| CruncherError::invalid_query("year is a required query parameter"))?;
    let report = get_cached_monthly_report(year, month, query.sp_entity_id, state.reports.clone()).await?;
    Ok(Json(report))
}

/// API: aggregation progress and busy flag
pub async fn api_watermark(State(state): State<Arc<AppState>>) -> ApiResult<WatermarkStatus> {
    Ok(Json(state.db.watermark().await?))
}

/// API: clear a stuck busy flag. Only safe once no aggregator is running.
pub async fn api_unlock(State(state): State<Arc<AppState>>) -> ApiResult<WatermarkStatus> {
    let before = state.db.watermark().await?;
    state.db.release().await?;
    tracing::warn!(
        "Busy flag reset by administrator (was busy={}, locked_at={:?}, position={})",
        before.busy,
        before.locked_at,
        before.position
    );
    Ok(Json(state.db.watermark().await?))
}

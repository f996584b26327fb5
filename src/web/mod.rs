//! Web server module

mod middleware;
mod routes;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::reports::Reports;
use crate::timeseries::TimeSeriesAssembler;

pub struct AppState {
    pub db: Database,
    pub assembler: TimeSeriesAssembler,
    pub reports: Reports,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Report API
        .route("/v1/logins", get(routes::api_logins))
        .route("/v1/lastlogin", get(routes::api_last_login))
        .route("/v1/versstats", get(routes::api_vers_stats))
        // Operator endpoints
        .route("/v1/admin/watermark", get(routes::api_watermark))
        .route("/v1/admin/watermark/unlock", post(routes::api_unlock))
        .layer(middleware::AccessLogLayer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(
    config: &Config,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{insert_daily, scratch};
    use crate::directory::StaticDirectory;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::NaiveDate;
    use serde_json::Value;
    use tower::ServiceExt;

    const DAY_MS: i64 = 86_400_000;

    async fn app() -> (Router, Database) {
        let (db, _) = scratch().await;
        let directory = Arc::new(StaticDirectory::from_pairs([("idp", "INST-1")]));
        let state = Arc::new(AppState {
            db: db.clone(),
            assembler: TimeSeriesAssembler::new(db.clone(), 366),
            reports: Reports::new(db.clone(), directory),
        });
        (router(state), db)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    fn millis(day: NaiveDate) -> i64 {
        day.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()
    }

    #[tokio::test]
    async fn logins_returns_dense_series() {
        let (app, db) = app().await;
        let start = NaiveDate::from_ymd_opt(2013, 1, 1).unwrap();
        for offset in [0, 6, 11] {
            insert_daily(&db, start + chrono::Duration::days(offset), "idp", "sp", 20).await;
        }

        // Mid-day millis still map to the same calendar day
        let uri = format!(
            "/v1/logins?startDate={}&endDate={}&idpEntityId=idp",
            millis(start) + 3_600_000,
            millis(start) + 11 * DAY_MS
        );
        let (status, body) = call(app, "GET", &uri).await;

        assert_eq!(status, StatusCode::OK);
        let series = body.as_array().unwrap();
        assert_eq!(series.len(), 1);
        let s = &series[0];
        assert_eq!(s["idpEntityId"], "idp");
        assert_eq!(s["idpName"], "idp name");
        assert_eq!(s["spEntityId"], "sp");
        assert_eq!(s["spName"], "sp name");
        assert_eq!(s["total"], 60);
        assert_eq!(s["pointStart"], millis(start));
        assert_eq!(s["pointEnd"], millis(start) + 11 * DAY_MS);
        assert_eq!(s["pointInterval"], DAY_MS);
        let data: Vec<i64> = s["data"].as_array().unwrap().iter().map(|v| v.as_i64().unwrap()).collect();
        assert_eq!(data, vec![20, 0, 0, 0, 0, 0, 20, 0, 0, 0, 0, 20]);
    }

    #[tokio::test]
    async fn logins_without_any_filter_is_bad_request() {
        let (app, _) = app().await;
        let (status, body) = call(app, "GET", "/v1/logins?startDate=0&endDate=86400000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("idpEntityId"));
    }

    #[tokio::test]
    async fn logins_without_dates_is_bad_request() {
        let (app, _) = app().await;
        let (status, _) = call(app, "GET", "/v1/logins?endDate=86400000&spEntityId=sp").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn last_login_requires_both_parameters() {
        let (app, _) = app().await;
        let (status, _) = call(app.clone(), "GET", "/v1/lastlogin?userId=u1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(app, "GET", "/v1/lastlogin?userId=u1&idpEntityId=idp").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn vers_stats_labels_institutions() {
        let (app, db) = app().await;
        let day = NaiveDate::from_ymd_opt(2011, 7, 4).unwrap();
        insert_daily(&db, day, "idp", "vers-sp", 3).await;
        insert_daily(&db, day, "unlisted-idp", "vers-sp", 2).await;

        let (status, body) = call(app, "GET", "/v1/versstats?month=7&year=2011&spEntityId=vers-sp").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalLoginCount"], 5);
        assert_eq!(body["institutionCounts"]["INST-1"], 3);
        assert_eq!(body["institutionCounts"][""], 2);
    }

    #[tokio::test]
    async fn admin_unlock_clears_the_flag() {
        let (app, db) = app().await;
        assert!(db.try_acquire().await.unwrap());

        let (status, body) = call(app.clone(), "GET", "/v1/admin/watermark").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["busy"], true);

        let (status, body) = call(app, "POST", "/v1/admin/watermark/unlock").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["busy"], false);
        assert_eq!(body["lockedAt"], Value::Null);
        assert!(!db.watermark().await.unwrap().busy);
    }
}

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::ApiState;

/// Latest heartbeat as JSON; 503 until the first cycle has finished or
/// while the last cycle reported `ok = false`.
pub async fn health(State(state): State<ApiState>) -> Response {
    let mut response = match state.health.latest().await {
        Some(heartbeat) => {
            let status = if heartbeat.ok {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(heartbeat)).into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": "no cycle has completed yet" })),
        )
            .into_response(),
    };

    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::api::{router, ApiState};
    use crate::health::HealthReporter;
    use crate::metrics::AppMetrics;
    use crate::scheduler::CycleReport;

    fn state(dir: &std::path::Path) -> ApiState {
        ApiState {
            health: Arc::new(HealthReporter::new(dir)),
            metrics: Arc::new(AppMetrics::new().unwrap()),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn unavailable_before_first_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let resp = router(state(dir.path())).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), 503);
        assert_eq!(resp.headers().get("cache-control").unwrap(), "no-store");
    }

    #[tokio::test]
    async fn returns_latest_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let mut report = CycleReport::new(Utc::now());
        report.points_total = 1;
        report.points_ok = 1;
        report.readings_stored = 5;
        state.health.report(&report).await;

        let resp = router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), 200);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["readings_stored"], 5);
    }
}

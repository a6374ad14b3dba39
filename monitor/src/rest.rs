use crate::errors::Error;
use crate::ingest::{IngestService, DEFAULT_ALERT_LIMIT};
use crate::metrics::INVALID_SAMPLES_TOTAL;
use crate::model::{AlertsResponse, FleetSnapshot, HealthResponse, IngestResponse, TelemetryRecord};
use crate::validate::validate;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Clone)]
struct AppState {
    service: Arc<IngestService>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    limit: Option<String>,
}

impl AlertsQuery {
    fn limit(&self) -> usize {
        self.limit
            .as_deref()
            .and_then(|l| l.trim().parse().ok())
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_ALERT_LIMIT)
    }
}

pub fn create_router(service: Arc<IngestService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/loconav-webhook", post(receive_telemetry))
        .route("/api/vehicles", get(get_vehicles))
        .route("/api/alerts", get(get_alerts))
        .route("/health", get(health))
        .with_state(state)
}

async fn receive_telemetry(
    State(state): State<AppState>,
    payload: Result<Json<TelemetryRecord>, JsonRejection>,
) -> Result<Json<IngestResponse>, AppError> {
    let Json(record) = payload?;
    let sample = validate(&record)?;

    let summary = state.service.ingest(vec![sample]).await;
    Ok(Json(IngestResponse {
        success: true,
        message: "Data received successfully".to_string(),
        vehicle_count: summary.vehicle_count,
        alert_count: summary.alert_count,
    }))
}

async fn get_vehicles(State(state): State<AppState>) -> Json<FleetSnapshot> {
    Json(state.service.fleet_snapshot())
}

async fn get_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertsQuery>,
) -> Json<AlertsResponse> {
    Json(state.service.alerts(params.limit()))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.service.health())
}

enum AppError {
    InvalidData(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::InvalidData(reason) => {
                INVALID_SAMPLES_TOTAL.inc();
                warn!("Rejected telemetry: {}", reason);
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid data format" })),
                )
                    .into_response()
            }
            AppError::Internal(e) => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("Internal server error: {}", e) })),
                )
                    .into_response()
            }
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(reason) => AppError::InvalidData(reason),
            Error::Json(e) => AppError::InvalidData(e.to_string()),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidData(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::sink::LogNotifier;

    fn state() -> AppState {
        AppState {
            service: Arc::new(IngestService::new(
                MonitorConfig::all_vehicles(80.0, 30),
                Arc::new(LogNotifier),
            )),
        }
    }

    fn record(body: &str) -> TelemetryRecord {
        serde_json::from_str(body).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_accepts_record() {
        let state = state();
        let now = chrono::Utc::now().timestamp();
        let body = format!(
            r#"{{"vehicle_number":"KA01","speed":95,"gpstime":{},"ignition_on":true}}"#,
            now
        );

        let Json(response) = receive_telemetry(State(state.clone()), Ok(Json(record(&body))))
            .await
            .ok()
            .unwrap();
        assert!(response.success);
        assert_eq!(response.message, "Data received successfully");
        assert_eq!(response.vehicle_count, 1);
        assert_eq!(response.alert_count, 1);

        let Json(vehicles) = get_vehicles(State(state.clone())).await;
        assert_eq!(vehicles.vehicles.len(), 1);
        assert!(vehicles.vehicles[0].ignition_on);
    }

    #[tokio::test]
    async fn test_webhook_rejects_missing_fields() {
        for body in [r#"{"speed":10}"#, r#"{"vehicle_number":"","speed":10}"#, r#"{"vehicle_number":"KA01"}"#] {
            let response = receive_telemetry(State(state()), Ok(Json(record(body))))
                .await
                .into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"], "Invalid data format");
        }
    }

    #[tokio::test]
    async fn test_webhook_null_speed_reads_as_parked() {
        let state = state();
        let response = receive_telemetry(
            State(state.clone()),
            Ok(Json(record(r#"{"vehicle_number":"KA01","speed":null}"#))),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);

        let Json(vehicles) = get_vehicles(State(state)).await;
        assert_eq!(vehicles.vehicles[0].speed, 0.0);
    }

    #[tokio::test]
    async fn test_alerts_limit() {
        let state = state();
        let now = chrono::Utc::now().timestamp();
        for speed in [90.0, 100.0, 110.0] {
            let body = format!(r#"{{"vehicle_number":"KA01","speed":{},"gpstime":{}}}"#, speed, now);
            let _ = receive_telemetry(State(state.clone()), Ok(Json(record(&body)))).await;
        }

        let query = AlertsQuery {
            limit: Some("2".to_string()),
        };
        let Json(alerts) = get_alerts(State(state.clone()), Query(query)).await;
        assert_eq!(alerts.total, 3);
        assert_eq!(alerts.alerts.len(), 2);
        assert!(alerts.alerts[1].message.contains("110"));

        let query = AlertsQuery {
            limit: Some("lots".to_string()),
        };
        let Json(alerts) = get_alerts(State(state.clone()), Query(query)).await;
        assert_eq!(alerts.alerts.len(), 3);
    }

    #[tokio::test]
    async fn test_health() {
        let Json(health) = health(State(state())).await;
        assert_eq!(health.status, "OK");
        assert_eq!(health.vehicles, 0);
        assert_eq!(health.alerts, 0);
    }

    #[test]
    fn test_default_limit() {
        assert_eq!(AlertsQuery::default().limit(), DEFAULT_ALERT_LIMIT);
        for raw in ["0", "-3", ""] {
            let query = AlertsQuery {
                limit: Some(raw.to_string()),
            };
            assert_eq!(query.limit(), DEFAULT_ALERT_LIMIT);
        }
        let query = AlertsQuery {
            limit: Some("7".to_string()),
        };
        assert_eq!(query.limit(), 7);
    }
}

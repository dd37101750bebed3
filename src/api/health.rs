use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::time::Instant;

use crate::controller::AppState;
use crate::dispatch::bounded;
use crate::store::StoreError;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

/// Individual health checks
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    store: ComponentHealth,
    engine: ComponentHealth,
}

/// Health status of a component
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy(latency_ms: Option<u64>) -> Self {
        Self {
            status: "healthy".to_string(),
            latency_ms,
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            latency_ms: None,
            error: Some(error),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// GET /healthz - store reachability and engine liveness
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = match check_store(&state).await {
        Ok(latency) => ComponentHealth::healthy(Some(latency)),
        Err(e) => ComponentHealth::unhealthy(e.to_string()),
    };
    let engine = if state.engine.is_running() {
        ComponentHealth::healthy(None)
    } else {
        ComponentHealth::unhealthy("dispatch engine stopped".to_string())
    };

    let all_healthy = store.is_healthy() && engine.is_healthy();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        checks: HealthChecks { store, engine },
    };

    (status_code, Json(response))
}

async fn check_store(state: &AppState) -> Result<u64, StoreError> {
    let start = Instant::now();
    bounded(
        state.cfg.engine.io_timeout(),
        StoreError::Timeout,
        state.store.latest_relay(),
    )
    .await?;
    Ok(start.elapsed().as_millis() as u64)
}

use std::collections::BTreeMap;

use axum::{Json, extract::State, http::StatusCode};
use futures::future::join_all;
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub probes: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub struct HealthErrorResponse {
    pub detail: HealthResponse,
}

/// Live health check: pings every engine at request time. 200 only when
/// the whole fleet answers.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthErrorResponse>)> {
    let checks = state.engines.iter().map(|(name, engine)| {
        let name = name.clone();
        let engine = engine.clone();
        async move { (name, engine.ping().await) }
    });

    let mut probes = BTreeMap::new();
    let mut healthy = true;

    for (name, result) in join_all(checks).await {
        match result {
            Ok(()) => {
                probes.insert(name, "connected".to_string());
            }
            Err(e) => {
                healthy = false;
                probes.insert(name, format!("error: {e}"));
            }
        }
    }

    if healthy {
        Ok(Json(HealthResponse {
            status: "healthy".to_string(),
            probes,
        }))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthErrorResponse {
                detail: HealthResponse {
                    status: "degraded".to_string(),
                    probes,
                },
            }),
        ))
    }
}

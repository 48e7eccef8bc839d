use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use super::{AppState, ErrorResponse};
use crate::db::queries;

#[derive(Debug, Serialize)]
pub struct ProbeStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub active_scans: i64,
}

#[derive(Debug, Serialize)]
pub struct ProbesResponse {
    pub probes: Vec<ProbeStatus>,
}

/// Per-probe utilization, straight from the store's live-scan counts.
pub async fn list_probes(
    State(state): State<AppState>,
) -> Result<Json<ProbesResponse>, (StatusCode, Json<ErrorResponse>)> {
    let counts = queries::active_scan_counts(&state.pool).await.map_err(|e| {
        tracing::error!("Store query failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("Store query failed", "DB_ERROR")),
        )
    })?;

    let probes = state
        .probes
        .iter()
        .map(|probe| ProbeStatus {
            name: probe.name.clone(),
            host: probe.host.clone(),
            port: probe.port,
            active_scans: counts.get(&probe.name).copied().unwrap_or(0),
        })
        .collect();

    Ok(Json(ProbesResponse { probes }))
}

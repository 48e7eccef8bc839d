use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AppState, ErrorResponse};
use crate::db::queries;
use crate::manager::{ScanRequest, SubmitError};
use crate::models::scan::{Scan, ScanSummary, ScanType};

// ============================================
// Request/Response Types
// ============================================

#[derive(Debug, Deserialize)]
pub struct SubmitScanRequest {
    pub target: String,
    #[serde(default = "default_scan_type")]
    pub scan_type: ScanType,
    #[serde(default)]
    pub ports: Option<Vec<u16>>,
    #[serde(default)]
    pub probe_name: Option<String>,
}

fn default_scan_type() -> ScanType {
    ScanType::Full
}

#[derive(Debug, Serialize)]
pub struct SubmitScanResponse {
    pub scan_id: Uuid,
    pub probe_name: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ListScansResponse {
    pub total: usize,
    pub scans: Vec<Scan>,
}

#[derive(Debug, Serialize)]
pub struct ScanReportResponse {
    pub scan_id: Uuid,
    pub probe_name: String,
    pub gvm_status: String,
    pub target: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub report_xml: Option<String>,
    pub summary: Option<ScanSummary>,
    pub error: Option<String>,
}

fn store_error(e: sqlx::Error) -> (StatusCode, Json<ErrorResponse>) {
    tracing::error!("Store query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("Store query failed", "DB_ERROR").with_details(e.to_string())),
    )
}

// ============================================
// Handlers
// ============================================

/// Submit an ad-hoc scan. The probe is bound here and never changes.
pub async fn submit_scan(
    State(state): State<AppState>,
    Json(request): Json<SubmitScanRequest>,
) -> Result<(StatusCode, Json<SubmitScanResponse>), (StatusCode, Json<ErrorResponse>)> {
    let submission = ScanRequest {
        target: request.target,
        scan_type: request.scan_type,
        ports: request.ports,
        probe_name: request.probe_name,
        external_target_id: None,
    };

    match state.manager.submit(submission).await {
        Ok((scan_id, probe_name)) => {
            let message = format!("Scan dispatched to probe {probe_name}");
            Ok((
                StatusCode::CREATED,
                Json(SubmitScanResponse {
                    scan_id,
                    probe_name,
                    message,
                }),
            ))
        }
        Err(e @ (SubmitError::Invalid(_) | SubmitError::ProbeNotFound(_) | SubmitError::NoProbes)) => {
            Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse::new(e.to_string(), "INVALID_SCAN_REQUEST")),
            ))
        }
        Err(SubmitError::Store(e)) => Err(store_error(e)),
    }
}

pub async fn list_scans(
    State(state): State<AppState>,
) -> Result<Json<ListScansResponse>, (StatusCode, Json<ErrorResponse>)> {
    let scans = queries::list_scans(&state.pool).await.map_err(store_error)?;
    Ok(Json(ListScansResponse {
        total: scans.len(),
        scans,
    }))
}

pub async fn get_scan(
    State(state): State<AppState>,
    Path(scan_id): Path<Uuid>,
) -> Result<Json<Scan>, (StatusCode, Json<ErrorResponse>)> {
    match queries::get_scan(&state.pool, scan_id).await.map_err(store_error)? {
        Some(scan) => Ok(Json(scan)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Scan not found", "SCAN_NOT_FOUND")),
        )),
    }
}

/// The report endpoint; 409 until the engine has reported `Done`.
pub async fn get_scan_report(
    State(state): State<AppState>,
    Path(scan_id): Path<Uuid>,
) -> Result<Json<ScanReportResponse>, (StatusCode, Json<ErrorResponse>)> {
    let scan = match queries::get_scan(&state.pool, scan_id).await.map_err(store_error)? {
        Some(scan) => scan,
        None => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("Scan not found", "SCAN_NOT_FOUND")),
            ));
        }
    };

    if scan.gvm_status != "Done" {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse::new(
                format!("Scan is {}; the report exists only once it is Done", scan.gvm_status),
                "REPORT_NOT_READY",
            )),
        ));
    }

    Ok(Json(ScanReportResponse {
        scan_id: scan.scan_id,
        probe_name: scan.probe_name,
        gvm_status: scan.gvm_status,
        target: scan.target,
        completed_at: scan.completed_at,
        report_xml: scan.report_xml,
        summary: scan.summary,
        error: scan.error,
    }))
}

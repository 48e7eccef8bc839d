use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;

use super::{AppState, ErrorResponse};
use crate::db::queries;
use crate::models::target::Target;

#[derive(Debug, Serialize)]
pub struct ListTargetsResponse {
    pub total: usize,
    pub targets: Vec<Target>,
}

fn store_error(e: sqlx::Error) -> (StatusCode, Json<ErrorResponse>) {
    tracing::error!("Store query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("Store query failed", "DB_ERROR")),
    )
}

pub async fn list_targets(
    State(state): State<AppState>,
) -> Result<Json<ListTargetsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let targets = queries::list_targets(&state.pool).await.map_err(store_error)?;
    Ok(Json(ListTargetsResponse {
        total: targets.len(),
        targets,
    }))
}

pub async fn get_target(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<Target>, (StatusCode, Json<ErrorResponse>)> {
    match queries::get_target(&state.pool, &external_id)
        .await
        .map_err(store_error)?
    {
        Some(target) => Ok(Json(target)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Target not found", "TARGET_NOT_FOUND")),
        )),
    }
}

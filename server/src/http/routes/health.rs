use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::http::server::RelayerServerState;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
}

#[utoipa::path(
    get,
    operation_id = "health",
    path = "/health",
    tag = "System",
    responses(
        (status = 200, description = "Process is up", body = HealthResponse, content_type = "application/json"),
    )
)]
/// Health Check
pub async fn health(State(state): State<RelayerServerState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            store: state.worker.store.backend_name().to_string(),
        }),
    )
}

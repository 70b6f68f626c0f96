use axum::{
    debug_handler,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use relayer_core::transaction_config::{TransactionConfig, TransactionConfigUpdate};

use crate::http::{error::ApiEngineError, server::RelayerServerState, types::SuccessResponse};

#[utoipa::path(
    get,
    operation_id = "getTransactionConfiguration",
    path = "/configuration/transactions",
    tag = "Configuration",
    responses(
        (status = 200, description = "Runtime tunables currently in effect", body = SuccessResponse<TransactionConfig>, content_type = "application/json"),
    )
)]
/// Get Transaction Configuration
#[debug_handler]
pub async fn get_transaction_configuration(
    State(state): State<RelayerServerState>,
) -> Result<impl IntoResponse, ApiEngineError> {
    let config = state.worker.config.snapshot();
    Ok((StatusCode::OK, Json(SuccessResponse::new(config.as_ref().clone()))))
}

#[utoipa::path(
    post,
    operation_id = "updateTransactionConfiguration",
    path = "/configuration/transactions",
    tag = "Configuration",
    request_body(content = TransactionConfigUpdate, description = "Fields to change, everything else is kept", content_type = "application/json"),
    responses(
        (status = 200, description = "Configuration after the update", body = SuccessResponse<TransactionConfig>, content_type = "application/json"),
        (status = 400, description = "The resulting configuration is invalid, nothing was changed"),
    )
)]
/// Update Transaction Configuration
///
/// Changes apply from the next scheduler tick. Setting a schedule to `null`
/// or an empty string disables that scheduler.
#[debug_handler]
pub async fn update_transaction_configuration(
    State(state): State<RelayerServerState>,
    Json(update): Json<TransactionConfigUpdate>,
) -> Result<impl IntoResponse, ApiEngineError> {
    let config = state.worker.config.update(&update)?;
    Ok((StatusCode::OK, Json(SuccessResponse::new(config.as_ref().clone()))))
}

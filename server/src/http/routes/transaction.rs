// Transaction Intake and Lifecycle Operations

use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use relayer_core::{error::EngineError, transaction::TransactionIntent};
use relayer_executors::relay::{TransactionRecord, TransactionStore};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::http::{error::ApiEngineError, server::RelayerServerState, types::SuccessResponse};

// ===== TYPES =====

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTransactionResponse {
    /// Identifier to poll the transaction with
    pub queue_id: String,
}

// ===== ROUTE HANDLERS =====

#[utoipa::path(
    post,
    operation_id = "queueTransaction",
    path = "/transaction",
    tag = "Transactions",
    request_body(content = TransactionIntent, description = "Transaction to send", content_type = "application/json"),
    responses(
        (status = 202, description = "Transaction queued", body = SuccessResponse<QueuedTransactionResponse>, content_type = "application/json"),
        (status = 400, description = "Invalid intent, unknown wallet or unsupported chain"),
    )
)]
/// Queue Transaction
///
/// Validate a transaction intent and queue it for submission. The returned
/// queue id is the transaction id used by every other transaction route.
#[debug_handler]
pub async fn queue_transaction(
    State(state): State<RelayerServerState>,
    Json(intent): Json<TransactionIntent>,
) -> Result<impl IntoResponse, ApiEngineError> {
    let record = state.worker.queue_transaction(intent).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SuccessResponse::new(QueuedTransactionResponse {
            queue_id: record.id,
        })),
    ))
}

#[utoipa::path(
    get,
    operation_id = "getTransaction",
    path = "/transaction/{id}",
    tag = "Transactions",
    responses(
        (status = 200, description = "Transaction record with its broadcast attempts", body = SuccessResponse<TransactionRecord>, content_type = "application/json"),
        (status = 404, description = "Unknown transaction"),
    ),
    params(
        ("id" = String, Path, description = "Transaction ID"),
    )
)]
/// Get Transaction
#[debug_handler]
pub async fn get_transaction(
    State(state): State<RelayerServerState>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, ApiEngineError> {
    let record = state
        .worker
        .store
        .get(&transaction_id)
        .await?
        .ok_or_else(|| EngineError::NotFound {
            message: format!("Transaction {transaction_id} not found"),
        })?;

    Ok((StatusCode::OK, Json(SuccessResponse::new(record))))
}

#[utoipa::path(
    post,
    operation_id = "cancelTransaction",
    path = "/transaction/{id}/cancel",
    tag = "Transactions",
    responses(
        (status = 200, description = "Transaction after the cancellation request", body = SuccessResponse<TransactionRecord>, content_type = "application/json"),
        (status = 400, description = "Transaction already finished"),
        (status = 404, description = "Unknown transaction"),
    ),
    params(
        ("id" = String, Path, description = "Transaction ID to cancel"),
    )
)]
/// Cancel Transaction
///
/// A queued transaction is cancelled right away. A transaction that already
/// holds a nonce is flagged instead: it is never broadcast again, but it can
/// still be mined with the payload already sent.
#[debug_handler]
pub async fn cancel_transaction(
    State(state): State<RelayerServerState>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, ApiEngineError> {
    tracing::info!(
        transaction_id = %transaction_id,
        "Processing transaction cancellation request"
    );

    let record = state.worker.cancel_transaction(&transaction_id).await?;

    Ok((StatusCode::OK, Json(SuccessResponse::new(record))))
}

use axum::{
    debug_handler,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use relayer_executors::relay::{
    TransactionStore,
    store::{TransactionPage, TransactionQuery},
};
use serde::Deserialize;

use crate::http::{error::ApiEngineError, server::RelayerServerState, types::SuccessResponse};

#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct PageParams {
    /// 1-based page number
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub chain_id: Option<u64>,
}

#[utoipa::path(
    get,
    operation_id = "listTransactions",
    path = "/transactions",
    tag = "Transactions",
    params(TransactionQuery),
    responses(
        (status = 200, description = "Page of transactions, oldest first", body = SuccessResponse<TransactionPage>, content_type = "application/json"),
    )
)]
/// List Transactions
///
/// Filter by status, extension, chain and creation time range.
#[debug_handler]
pub async fn list_transactions(
    State(state): State<RelayerServerState>,
    Query(query): Query<TransactionQuery>,
) -> Result<impl IntoResponse, ApiEngineError> {
    let page = state.worker.store.query(&query).await?;
    Ok((StatusCode::OK, Json(SuccessResponse::new(page))))
}

#[utoipa::path(
    get,
    operation_id = "listDeployedContracts",
    path = "/transactions/deployed-contracts",
    tag = "Transactions",
    params(PageParams),
    responses(
        (status = 200, description = "Mined deployment transactions with their contract address", body = SuccessResponse<TransactionPage>, content_type = "application/json"),
    )
)]
/// List Deployed Contracts
#[debug_handler]
pub async fn list_deployed_contracts(
    State(state): State<RelayerServerState>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, ApiEngineError> {
    let query = TransactionQuery {
        chain_id: params.chain_id,
        page: params.page,
        limit: params.limit,
        deployed_only: true,
        ..Default::default()
    };

    let page = state.worker.store.query(&query).await?;
    Ok((StatusCode::OK, Json(SuccessResponse::new(page))))
}

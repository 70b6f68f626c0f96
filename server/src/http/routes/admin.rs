use alloy::primitives::Address;
use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use relayer_core::defs::AddressDef;
use relayer_executors::relay::WalletKey;
use serde::Serialize;
use utoipa::ToSchema;

use crate::http::{error::ApiEngineError, server::RelayerServerState, types::SuccessResponse};

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonceResetResponse {
    pub chain_id: u64,
    #[schema(value_type = AddressDef)]
    pub wallet_address: Address,
}

#[utoipa::path(
    post,
    operation_id = "resetNonces",
    path = "/admin/nonce/{chain_id}/{wallet_address}/reset",
    tag = "Admin",
    responses(
        (status = 200, description = "Nonce bookkeeping dropped, the wallet resyncs from the chain", body = SuccessResponse<NonceResetResponse>, content_type = "application/json"),
    ),
    params(
        ("chain_id" = u64, Path, description = "Chain ID"),
        ("wallet_address" = String, Path, description = "Wallet address"),
    )
)]
/// Reset Wallet Nonces
///
/// Drops the local nonce counter and released nonces of a wallet. The next
/// submission tick starts again from the nonce the chain reports.
#[debug_handler]
pub async fn reset_nonces(
    State(state): State<RelayerServerState>,
    Path((chain_id, wallet_address)): Path<(u64, Address)>,
) -> Result<impl IntoResponse, ApiEngineError> {
    state
        .worker
        .reset_nonces(WalletKey {
            chain_id,
            wallet: wallet_address,
        })
        .await?;

    tracing::warn!(
        chain_id = chain_id,
        wallet = %wallet_address,
        "Nonce bookkeeping reset by operator"
    );

    Ok((
        StatusCode::OK,
        Json(SuccessResponse::new(NonceResetResponse {
            chain_id,
            wallet_address,
        })),
    ))
}

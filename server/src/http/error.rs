use axum::{Json, http::StatusCode, response::IntoResponse};
use relayer_core::error::{EngineError, RpcErrorKind};
use relayer_executors::relay::{RelayerError, TransactionStoreError};

use super::types::{ErrorResponse, ErrorResponseInner};

/// Pairs an [`EngineError`] with an HTTP status code
#[derive(Debug)]
pub struct ApiEngineError(pub EngineError);

impl From<EngineError> for ApiEngineError {
    fn from(error: EngineError) -> Self {
        ApiEngineError(error)
    }
}

impl From<TransactionStoreError> for ApiEngineError {
    fn from(error: TransactionStoreError) -> Self {
        ApiEngineError(error.into())
    }
}

impl From<RelayerError> for ApiEngineError {
    fn from(error: RelayerError) -> Self {
        ApiEngineError(error.into())
    }
}

impl IntoResponse for ApiEngineError {
    fn into_response(self) -> axum::response::Response {
        let code = self.status_code();

        self.with_status(code)
    }
}

impl ApiEngineError {
    fn with_status(self, status: StatusCode) -> axum::response::Response {
        let body = ErrorResponse {
            error: ErrorResponseInner {
                message: self.0.to_string(),
                details: self.0,
            },
        };

        (status, Json(body)).into_response()
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            EngineError::RpcError { kind, .. } => match kind {
                RpcErrorKind::NullResp => StatusCode::BAD_GATEWAY,
                RpcErrorKind::ErrorResp(_) => StatusCode::BAD_GATEWAY,
                RpcErrorKind::UnsupportedFeature { .. } => StatusCode::NOT_IMPLEMENTED,
                RpcErrorKind::TransportHttpError { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                RpcErrorKind::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            EngineError::RpcConfigError { .. } => StatusCode::BAD_REQUEST,
            EngineError::ValidationError { .. } => StatusCode::BAD_REQUEST,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::SigningError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_client_statuses() {
        let missing = ApiEngineError::from(TransactionStoreError::TransactionNotFound {
            transaction_id: "abc".to_string(),
        });
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let conflict = ApiEngineError::from(TransactionStoreError::RedisError {
            message: "connection refused".to_string(),
        });
        assert_eq!(conflict.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn rpc_timeouts_are_gateway_timeouts() {
        let error = ApiEngineError(EngineError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            message: "eth_blockNumber timed out".to_string(),
            kind: RpcErrorKind::Timeout { timeout_ms: 100 },
        });
        assert_eq!(error.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}

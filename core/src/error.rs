use std::{fmt, time::Duration};

use alloy::transports::{RpcError, TransportErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Chain;

/// What went wrong on a node call, as far as the transport can tell
#[derive(Debug, Error, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// The node answered with a JSON-RPC error object
    #[error("node returned an error: {0}")]
    ErrorResp(RpcErrorResponse),

    #[error("node returned null where a value was expected")]
    NullResp,

    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// The request could not be built locally
    #[error("local usage error: {message}")]
    LocalUsage { message: String },

    /// Request or response body did not (de)serialize
    #[error("encoding error: {message}")]
    Encoding { message: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    /// No answer within the request deadline. The node may still have
    /// received and acted on the request.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

#[derive(Debug, Serialize, Deserialize, Clone, utoipa::ToSchema)]
pub struct RpcErrorResponse {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

impl fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

impl From<&RpcError<TransportErrorKind>> for RpcErrorKind {
    fn from(error: &RpcError<TransportErrorKind>) -> Self {
        match error {
            RpcError::ErrorResp(payload) => RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: payload.code,
                message: payload.message.to_string(),
                data: payload.data.as_ref().map(|data| data.to_string()),
            }),
            RpcError::NullResp => RpcErrorKind::NullResp,
            RpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
                message: feature.to_string(),
            },
            RpcError::LocalUsageError(e) => RpcErrorKind::LocalUsage {
                message: e.to_string(),
            },
            RpcError::SerError(e) => RpcErrorKind::Encoding {
                message: e.to_string(),
            },
            RpcError::DeserError { err, text } => RpcErrorKind::Encoding {
                message: format!("{err}, text: {text}"),
            },
            RpcError::Transport(TransportErrorKind::HttpError(http)) => {
                RpcErrorKind::TransportHttpError {
                    status: http.status,
                    body: http.body.clone(),
                }
            }
            RpcError::Transport(other) => RpcErrorKind::Transport {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum EngineError {
    #[schema(title = "EVM RPC Error")]
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[schema(title = "RPC Configuration Error")]
    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[schema(title = "Validation Error")]
    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[schema(title = "Not Found Error")]
    #[error("Not found: {message}")]
    NotFound { message: String },

    #[schema(title = "Signing Error")]
    #[error("Signing error: {message}")]
    SigningError { message: String },

    #[schema(title = "Relayer Internal Error")]
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::ValidationError {
            message: message.into(),
        }
    }

    /// Wraps a failed node call with the chain it was made against
    pub fn rpc(chain: &impl Chain, error: &RpcError<TransportErrorKind>) -> Self {
        EngineError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url().to_string(),
            message: error.to_string(),
            kind: error.into(),
        }
    }

    /// Error for an RPC call that exceeded its deadline
    pub fn rpc_timeout(chain: &impl Chain, operation: &str, timeout: Duration) -> Self {
        EngineError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url().to_string(),
            message: format!("{operation} timed out"),
            kind: RpcErrorKind::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
        }
    }

    /// Returns the RPC error kind if this error came from a node call
    pub fn rpc_kind(&self) -> Option<&RpcErrorKind> {
        match self {
            EngineError::RpcError { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(error: redis::RedisError) -> Self {
        EngineError::InternalError {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::rpc::json_rpc::ErrorPayload;

    use super::*;

    #[test]
    fn error_payloads_keep_code_and_message() {
        let error: RpcError<TransportErrorKind> = RpcError::ErrorResp(ErrorPayload {
            code: -32000,
            message: "nonce too low".into(),
            data: None,
        });

        match RpcErrorKind::from(&error) {
            RpcErrorKind::ErrorResp(resp) => {
                assert_eq!(resp.code, -32000);
                assert_eq!(resp.message, "nonce too low");
                assert_eq!(resp.to_string(), "code -32000: nonce too low");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn errors_serialize_with_type_tag() {
        let error = EngineError::validation("gasLimit must be greater than zero");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "VALIDATION_ERROR");
        assert_eq!(json["message"], "gasLimit must be greater than zero");
    }
}

use relayer_core::error::{EngineError, RpcErrorKind};
use serde::{Deserialize, Serialize};

use crate::relay::{nonce_manager::NonceError, store::TransactionStoreError};

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum RelayerError {
    #[error("Chain service error for chainId {chain_id}: {message}")]
    ChainServiceError { chain_id: u64, message: String },

    #[error("Store error: {message}")]
    StoreError {
        message: String,
        inner_error: TransactionStoreError,
    },

    #[error("Nonce error: {message}")]
    NonceError {
        message: String,
        inner_error: NonceError,
    },

    #[error("Transaction simulation failed: {message}")]
    TransactionSimulationFailed {
        message: String,
        inner_error: EngineError,
    },

    #[error("RPC error encountered during generic operation: {message}")]
    RpcError {
        message: String,
        inner_error: EngineError,
    },

    #[error("Error encountered when broadcasting transaction: {message}")]
    TransactionSendError {
        message: String,
        inner_error: EngineError,
    },

    #[error("Transaction signing failed: {message}")]
    SigningError {
        message: String,
        inner_error: EngineError,
    },

    #[error("Transaction build failed: {message}")]
    TransactionBuildFailed { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<RelayerError> for EngineError {
    fn from(error: RelayerError) -> Self {
        match error {
            RelayerError::StoreError { inner_error, .. } => inner_error.into(),
            RelayerError::RpcError { inner_error, .. }
            | RelayerError::TransactionSendError { inner_error, .. }
            | RelayerError::SigningError { inner_error, .. } => inner_error,
            other => EngineError::InternalError {
                message: other.to_string(),
            },
        }
    }
}

impl From<TransactionStoreError> for RelayerError {
    fn from(error: TransactionStoreError) -> Self {
        RelayerError::StoreError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<NonceError> for RelayerError {
    fn from(error: NonceError) -> Self {
        RelayerError::NonceError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl RelayerError {
    /// Whether the record itself is at fault, as opposed to the chain or the store
    pub fn is_deterministic(&self) -> bool {
        match self {
            RelayerError::TransactionSimulationFailed { .. }
            | RelayerError::TransactionBuildFailed { .. } => true,
            RelayerError::SigningError { inner_error, .. } => !matches!(
                inner_error,
                EngineError::RpcError { .. } | EngineError::InternalError { .. }
            ),
            _ => false,
        }
    }
}

// ========== SEND ERROR CLASSIFICATION ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorClassification {
    /// The node may hold the transaction ("nonce too low", "already known", timeouts)
    PossiblySent,
    /// Rejected before the nonce was consumed, the record can be sent again
    DeterministicFailure,
    /// Rejected for a reason sending again will not fix
    DeterministicFailureNonRetryable,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SendContext {
    Rebroadcast,
    InitialBroadcast,
}

/// Node messages meaning the payload may already sit in a mempool
const POSSIBLY_SENT_MARKERS: &[&str] = &[
    "nonce too low",
    "already known",
    "replacement transaction underpriced",
    "transaction already imported",
];

/// Rejections no rebuilt payload will get past
const FATAL_MARKERS: &[&str] = &["oversized", "invalid chain", "invalid sender"];

/// Rejections that leave the nonce unused, a rebuilt payload may pass
const REJECTED_MARKERS: &[&str] = &[
    "invalid signature",
    "malformed",
    "invalid transaction format",
    "nonce too high",
    "user cant pay the bills",
    "gas limit",
    "intrinsic gas too low",
    "fee cap less than block base fee",
    "max fee per gas less than block base fee",
];

fn contains_any(message: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| message.contains(marker))
}

#[tracing::instrument(skip_all, fields(error = %error, context = ?context))]
pub fn classify_send_error(error: &EngineError, context: SendContext) -> SendErrorClassification {
    let Some(kind) = error.rpc_kind() else {
        return SendErrorClassification::DeterministicFailure;
    };

    let resp = match kind {
        RpcErrorKind::ErrorResp(resp) => resp,
        RpcErrorKind::Encoding { .. } | RpcErrorKind::LocalUsage { .. } => {
            return SendErrorClassification::DeterministicFailure;
        }
        // Rate limits and bad requests never reach the mempool
        RpcErrorKind::TransportHttpError { status, .. } if (400..500).contains(status) => {
            return SendErrorClassification::DeterministicFailure;
        }
        // Timeouts and broken connections are ambiguous
        _ => return SendErrorClassification::PossiblySent,
    };

    let message = resp.message.to_lowercase();

    // A rebroadcast of a funded payload can race the balance check
    if message.contains("insufficient funds") {
        return match context {
            SendContext::InitialBroadcast => SendErrorClassification::DeterministicFailure,
            SendContext::Rebroadcast => SendErrorClassification::PossiblySent,
        };
    }

    if contains_any(&message, POSSIBLY_SENT_MARKERS) {
        SendErrorClassification::PossiblySent
    } else if contains_any(&message, FATAL_MARKERS) {
        SendErrorClassification::DeterministicFailureNonRetryable
    } else if contains_any(&message, REJECTED_MARKERS) {
        SendErrorClassification::DeterministicFailure
    } else {
        tracing::warn!(message = %message, "Unrecognized send error, treating as possibly sent");
        SendErrorClassification::PossiblySent
    }
}

/// Whether a failed gas estimation means the call itself reverts
pub fn is_revert_error(error: &EngineError) -> bool {
    match error.rpc_kind() {
        Some(RpcErrorKind::ErrorResp(resp)) => {
            let message = resp.message.to_lowercase();
            // Code 3 carries revert data, some providers only say so in the message
            resp.code == 3 || message.contains("revert") || message.contains("oversized")
        }
        _ => false,
    }
}

/// Whether a failed read call may succeed on a later tick
pub fn is_retryable_rpc_error(kind: &RpcErrorKind) -> bool {
    match kind {
        RpcErrorKind::TransportHttpError { status: 408 | 429, .. } => true,
        RpcErrorKind::TransportHttpError { status, .. } if *status >= 400 && *status < 500 => false,
        RpcErrorKind::UnsupportedFeature { .. } => false,
        RpcErrorKind::ErrorResp(resp) => {
            let message = resp.message.to_lowercase();
            !(message.contains("invalid chain") || message.contains("invalid opcode"))
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use relayer_core::error::RpcErrorResponse;

    use super::*;

    fn rpc(kind: RpcErrorKind) -> EngineError {
        EngineError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545/".to_string(),
            message: kind.to_string(),
            kind,
        }
    }

    fn resp(code: i64, message: &str) -> EngineError {
        rpc(RpcErrorKind::ErrorResp(RpcErrorResponse {
            code,
            message: message.to_string(),
            data: None,
        }))
    }

    #[test]
    fn timeouts_are_possibly_sent() {
        let error = rpc(RpcErrorKind::Timeout { timeout_ms: 5_000 });
        assert_eq!(
            classify_send_error(&error, SendContext::InitialBroadcast),
            SendErrorClassification::PossiblySent
        );
    }

    #[test]
    fn nonce_too_low_is_possibly_sent() {
        assert_eq!(
            classify_send_error(&resp(-32000, "nonce too low"), SendContext::Rebroadcast),
            SendErrorClassification::PossiblySent
        );
        assert_eq!(
            classify_send_error(&resp(-32000, "already known"), SendContext::InitialBroadcast),
            SendErrorClassification::PossiblySent
        );
    }

    #[test]
    fn insufficient_funds_depends_on_context() {
        let error = resp(-32000, "insufficient funds for gas * price + value");
        assert_eq!(
            classify_send_error(&error, SendContext::InitialBroadcast),
            SendErrorClassification::DeterministicFailure
        );
        assert_eq!(
            classify_send_error(&error, SendContext::Rebroadcast),
            SendErrorClassification::PossiblySent
        );
    }

    #[test]
    fn oversized_is_not_retryable() {
        assert_eq!(
            classify_send_error(&resp(-32000, "oversized data"), SendContext::InitialBroadcast),
            SendErrorClassification::DeterministicFailureNonRetryable
        );
    }

    #[test]
    fn rate_limit_is_deterministic() {
        let error = rpc(RpcErrorKind::TransportHttpError {
            status: 429,
            body: "too many requests".to_string(),
        });
        assert_eq!(
            classify_send_error(&error, SendContext::InitialBroadcast),
            SendErrorClassification::DeterministicFailure
        );
    }

    #[test]
    fn throttling_is_retryable() {
        assert!(is_retryable_rpc_error(&RpcErrorKind::TransportHttpError {
            status: 429,
            body: String::new(),
        }));
        assert!(!is_retryable_rpc_error(&RpcErrorKind::TransportHttpError {
            status: 401,
            body: String::new(),
        }));
    }

    #[test]
    fn revert_detection() {
        assert!(is_revert_error(&resp(3, "execution reverted: Ownable")));
        assert!(is_revert_error(&resp(-32000, "Execution Reverted")));
        assert!(!is_revert_error(&resp(-32000, "header not found")));
        assert!(!is_revert_error(&rpc(RpcErrorKind::Timeout { timeout_ms: 1 })));
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::TransactionStatus;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum TransactionStoreError {
    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Serialization error: {message}")]
    DeserError { message: String },

    #[error("Transaction not found: {transaction_id}")]
    TransactionNotFound { transaction_id: String },

    #[error("Transaction already exists: {transaction_id}")]
    AlreadyExists { transaction_id: String },

    #[error("Transaction {transaction_id} changed concurrently, expected revision {expected}")]
    RevisionConflict { transaction_id: String, expected: u64 },

    #[error("Transaction {transaction_id} still contended after {attempts} update attempts")]
    Contended { transaction_id: String, attempts: u32 },

    #[error("Illegal status transition for {transaction_id}: {from} -> {to}")]
    IllegalTransition {
        transaction_id: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<redis::RedisError> for TransactionStoreError {
    fn from(error: redis::RedisError) -> Self {
        TransactionStoreError::RedisError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransactionStoreError {
    fn from(error: serde_json::Error) -> Self {
        TransactionStoreError::DeserError {
            message: error.to_string(),
        }
    }
}

impl From<TransactionStoreError> for relayer_core::error::EngineError {
    fn from(error: TransactionStoreError) -> Self {
        match error {
            TransactionStoreError::TransactionNotFound { transaction_id } => {
                relayer_core::error::EngineError::NotFound {
                    message: format!("Transaction {transaction_id} not found"),
                }
            }
            TransactionStoreError::IllegalTransition { .. } => {
                relayer_core::error::EngineError::ValidationError {
                    message: error.to_string(),
                }
            }
            other => relayer_core::error::EngineError::InternalError {
                message: other.to_string(),
            },
        }
    }
}

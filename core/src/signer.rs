use std::collections::HashMap;

use alloy::{
    consensus::{SignableTransaction, Transaction, TypedTransaction},
    primitives::{Address, ChainId, Signature},
    signers::{SignerSync, local::PrivateKeySigner},
};
use serde::{Deserialize, Serialize};

use crate::{defs::AddressDef, error::EngineError};

/// EOA signing options
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EoaSigningOptions {
    /// The EOA address to sign with
    #[schema(value_type = AddressDef)]
    pub from: Address,
    /// Optional chain ID for the signature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
}

/// Produces signatures for transactions sent from relayer wallets
pub trait TransactionSigner: Send + Sync {
    fn sign_transaction(
        &self,
        options: EoaSigningOptions,
        transaction: &TypedTransaction,
    ) -> impl std::future::Future<Output = Result<Signature, EngineError>> + Send;

    /// Whether transactions from `address` can be signed
    fn has_wallet(&self, address: &Address) -> bool;
}

/// Signs with private keys held in process memory
#[derive(Clone, Default)]
pub struct LocalKeySigner {
    keys: HashMap<Address, PrivateKeySigner>,
}

impl LocalKeySigner {
    pub fn new(signers: impl IntoIterator<Item = PrivateKeySigner>) -> Self {
        Self {
            keys: signers
                .into_iter()
                .map(|signer| (signer.address(), signer))
                .collect(),
        }
    }

    pub fn from_private_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, EngineError> {
        let signers = keys
            .iter()
            .map(|key| {
                key.as_ref()
                    .parse::<PrivateKeySigner>()
                    .map_err(|e| EngineError::validation(format!("Invalid wallet key: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(signers))
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.keys.keys()
    }
}

impl TransactionSigner for LocalKeySigner {
    fn has_wallet(&self, address: &Address) -> bool {
        self.keys.contains_key(address)
    }

    async fn sign_transaction(
        &self,
        options: EoaSigningOptions,
        transaction: &TypedTransaction,
    ) -> Result<Signature, EngineError> {
        let signer = self
            .keys
            .get(&options.from)
            .ok_or_else(|| EngineError::SigningError {
                message: format!("No signing key configured for wallet {}", options.from),
            })?;

        if let (Some(expected), Some(actual)) = (options.chain_id, transaction.chain_id()) {
            if expected != actual {
                return Err(EngineError::SigningError {
                    message: format!(
                        "Transaction chain id {actual} does not match signing chain id {expected}"
                    ),
                });
            }
        }

        signer
            .sign_hash_sync(&transaction.signature_hash())
            .map_err(|e| EngineError::SigningError {
                message: e.to_string(),
            })
    }
}

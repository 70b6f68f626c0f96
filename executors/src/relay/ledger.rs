use std::{
    future::{Future, IntoFuture},
    time::Duration,
};

use alloy::{
    network::{ReceiptResponse, TransactionBuilder},
    primitives::{Address, B256, Bytes, U256},
    providers::Provider,
    rpc::types::TransactionRequest as AlloyTransactionRequest,
    transports::{RpcError, TransportErrorKind},
};
use relayer_core::{
    chain::Chain,
    error::EngineError,
    transaction::FeeValues,
};

/// What the chain reports for a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptOutcome {
    pub hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
}

/// Call parameters used for gas estimation
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub chain_id: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

/// Read and broadcast access to one chain.
///
/// Every call is bounded by a timeout. A timed out call surfaces as an
/// `RpcErrorKind::Timeout` error, which callers treat as an ambiguous result.
pub trait Ledger: Send + Sync {
    fn chain_id(&self) -> u64;

    fn block_number(&self) -> impl Future<Output = Result<u64, EngineError>> + Send;

    /// Confirmed transaction count of `wallet`, the next nonce the chain expects
    fn account_nonce(
        &self,
        wallet: Address,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    fn receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<ReceiptOutcome>, EngineError>> + Send;

    /// Current network fees, EIP-1559 when supported and legacy otherwise
    fn estimate_fees(&self) -> impl Future<Output = Result<FeeValues, EngineError>> + Send;

    fn estimate_gas(
        &self,
        call: &CallRequest,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    fn send_raw_transaction(
        &self,
        raw: &Bytes,
    ) -> impl Future<Output = Result<B256, EngineError>> + Send;
}

/// Resolves a [`Ledger`] per chain
pub trait LedgerService: Send + Sync + 'static {
    type Ledger: Ledger;

    fn ledger(&self, chain_id: u64) -> Result<Self::Ledger, EngineError>;
}

/// [`Ledger`] backed by a JSON-RPC provider
pub struct RpcLedger<C: Chain> {
    chain: C,
    timeout: Duration,
}

impl<C: Chain> RpcLedger<C> {
    pub fn new(chain: C, timeout: Duration) -> Self {
        Self { chain, timeout }
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, EngineError>
    where
        F: IntoFuture<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|e| EngineError::rpc(&self.chain, &e)),
            Err(_) => {
                tracing::warn!(
                    chain_id = self.chain.chain_id(),
                    operation = operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                Err(EngineError::rpc_timeout(&self.chain, operation, self.timeout))
            }
        }
    }
}

fn is_unsupported_eip1559_error(error: &RpcError<TransportErrorKind>) -> bool {
    if let RpcError::UnsupportedFeature(_) = error {
        return true;
    }

    if let RpcError::ErrorResp(resp) = error {
        let message = resp.message.to_lowercase();
        return message.contains("method not found") || message.contains("eip-1559");
    }

    false
}

impl<C: Chain> Ledger for RpcLedger<C> {
    fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        self.bounded("eth_blockNumber", self.chain.provider().get_block_number())
            .await
    }

    async fn account_nonce(&self, wallet: Address) -> Result<u64, EngineError> {
        self.bounded(
            "eth_getTransactionCount",
            self.chain.provider().get_transaction_count(wallet).latest(),
        )
        .await
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptOutcome>, EngineError> {
        let receipt = self
            .bounded(
                "eth_getTransactionReceipt",
                self.chain.provider().get_transaction_receipt(hash),
            )
            .await?;

        Ok(receipt.map(|receipt| ReceiptOutcome {
            hash,
            success: receipt.status(),
            block_number: receipt.block_number(),
            gas_used: receipt.gas_used(),
            contract_address: receipt.contract_address(),
        }))
    }

    async fn estimate_fees(&self) -> Result<FeeValues, EngineError> {
        let provider = self.chain.provider();

        let eip1559 =
            match tokio::time::timeout(self.timeout, provider.estimate_eip1559_fees()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(EngineError::rpc_timeout(
                        &self.chain,
                        "eth_feeHistory",
                        self.timeout,
                    ));
                }
            };

        match eip1559 {
            Ok(fees) => {
                tracing::debug!(
                    "Using EIP-1559 fees: max_fee={}, max_priority_fee={}",
                    fees.max_fee_per_gas,
                    fees.max_priority_fee_per_gas
                );
                Ok(FeeValues::Eip1559 {
                    max_fee_per_gas: fees.max_fee_per_gas,
                    max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
                })
            }
            Err(eip1559_error) if is_unsupported_eip1559_error(&eip1559_error) => {
                tracing::debug!("EIP-1559 not supported, falling back to legacy gas price");
                let gas_price = self
                    .bounded("eth_gasPrice", provider.get_gas_price())
                    .await?;
                Ok(FeeValues::Legacy { gas_price })
            }
            Err(eip1559_error) => Err(EngineError::rpc(&self.chain, &eip1559_error)),
        }
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, EngineError> {
        let mut request = AlloyTransactionRequest::default()
            .with_from(call.from)
            .with_value(call.value)
            .with_input(call.data.clone())
            .with_chain_id(call.chain_id);

        if let Some(to) = call.to {
            request = request.with_to(to);
        }

        self.bounded("eth_estimateGas", self.chain.provider().estimate_gas(request))
            .await
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, EngineError> {
        let pending = self
            .bounded(
                "eth_sendRawTransaction",
                self.chain.provider().send_raw_transaction(raw),
            )
            .await?;

        Ok(*pending.tx_hash())
    }
}

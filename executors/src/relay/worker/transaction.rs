use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy, TypedTransaction},
    eips::Encodable2718,
    primitives::{B256, Bytes, TxKind},
};
use relayer_core::{
    error::EngineError,
    signer::{EoaSigningOptions, TransactionSigner},
    transaction::{FeeValues, TransactionTypeData},
};

use crate::relay::{
    ledger::{CallRequest, Ledger, LedgerService},
    store::{TransactionRecord, TransactionStore},
    worker::{
        RelayWorker,
        error::{RelayerError, is_retryable_rpc_error, is_revert_error},
    },
};

/// Gas limit and fees for a first broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedTransaction {
    pub gas_limit: u64,
    pub fees: FeeValues,
}

/// A signed payload ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}

/// Fills in whatever the intent left open from the network estimate
pub fn resolve_fees(overrides: Option<&TransactionTypeData>, estimate: FeeValues) -> FeeValues {
    let (estimated_max, estimated_priority) = match estimate {
        FeeValues::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => (max_fee_per_gas, max_priority_fee_per_gas),
        FeeValues::Legacy { gas_price } => (gas_price, gas_price),
    };

    match overrides {
        Some(TransactionTypeData::Eip1559(data)) => {
            let max_fee_per_gas = data.max_fee_per_gas.unwrap_or(estimated_max);
            let max_priority_fee_per_gas = data
                .max_priority_fee_per_gas
                .unwrap_or(estimated_priority)
                .min(max_fee_per_gas);
            FeeValues::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }
        }
        Some(TransactionTypeData::Legacy(data)) => FeeValues::Legacy {
            gas_price: data.gas_price.unwrap_or(estimated_max),
        },
        None => estimate,
    }
}

/// Whether the intent fixes every fee so no estimate is needed
fn fees_fully_specified(overrides: Option<&TransactionTypeData>) -> Option<FeeValues> {
    match overrides? {
        TransactionTypeData::Eip1559(data) => Some(FeeValues::Eip1559 {
            max_fee_per_gas: data.max_fee_per_gas?,
            max_priority_fee_per_gas: data.max_priority_fee_per_gas?,
        }),
        TransactionTypeData::Legacy(data) => Some(FeeValues::Legacy {
            gas_price: data.gas_price?,
        }),
    }
}

pub fn build_typed_transaction(
    record: &TransactionRecord,
    nonce: u64,
    gas_limit: u64,
    fees: FeeValues,
) -> TypedTransaction {
    let to = match record.contract_address {
        Some(address) => TxKind::Call(address),
        None => TxKind::Create,
    };

    match fees {
        FeeValues::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => TypedTransaction::Eip1559(TxEip1559 {
            chain_id: record.chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            to,
            value: record.value,
            access_list: Default::default(),
            input: record.data.clone(),
        }),
        FeeValues::Legacy { gas_price } => TypedTransaction::Legacy(TxLegacy {
            chain_id: Some(record.chain_id),
            nonce,
            gas_price,
            gas_limit,
            to,
            value: record.value,
            input: record.data.clone(),
        }),
    }
}

impl<S, L, G> RelayWorker<S, L, G>
where
    S: TransactionStore,
    L: LedgerService,
    G: TransactionSigner,
{
    /// Estimates what the intent left open. Runs before a nonce is taken.
    pub(crate) async fn prepare_transaction(
        &self,
        ledger: &L::Ledger,
        record: &TransactionRecord,
    ) -> Result<PreparedTransaction, RelayerError> {
        let gas_limit = match record.gas_limit {
            Some(gas_limit) => gas_limit,
            None => {
                let call = CallRequest {
                    chain_id: record.chain_id,
                    from: record.wallet_address,
                    to: record.contract_address,
                    value: record.value,
                    data: record.data.clone(),
                };

                match ledger.estimate_gas(&call).await {
                    Ok(gas_limit) => buffered_gas_limit(gas_limit),
                    Err(e) => return Err(preparation_error("Gas estimation failed", e)),
                }
            }
        };

        let fees = match fees_fully_specified(record.fees.as_ref()) {
            Some(fees) => fees,
            None => {
                let estimate = ledger
                    .estimate_fees()
                    .await
                    .map_err(|e| RelayerError::RpcError {
                        message: format!("Fee estimation failed: {e}"),
                        inner_error: e,
                    })?;
                resolve_fees(record.fees.as_ref(), estimate)
            }
        };

        Ok(PreparedTransaction { gas_limit, fees })
    }

    pub(crate) async fn sign_transaction(
        &self,
        record: &TransactionRecord,
        nonce: u64,
        gas_limit: u64,
        fees: FeeValues,
    ) -> Result<SignedTransaction, RelayerError> {
        let typed_tx = build_typed_transaction(record, nonce, gas_limit, fees);

        let signing_options = EoaSigningOptions {
            from: record.wallet_address,
            chain_id: Some(record.chain_id),
        };

        let signature = self
            .signer
            .sign_transaction(signing_options, &typed_tx)
            .await
            .map_err(|engine_error| RelayerError::SigningError {
                message: format!("Failed to sign transaction: {engine_error}"),
                inner_error: engine_error,
            })?;

        let signed = typed_tx.into_signed(signature);
        let hash = *signed.hash();
        let envelope: TxEnvelope = signed.into();

        Ok(SignedTransaction {
            hash,
            raw: envelope.encoded_2718().into(),
        })
    }
}

fn preparation_error(context: &str, error: EngineError) -> RelayerError {
    let deterministic = is_revert_error(&error)
        || error
            .rpc_kind()
            .is_some_and(|kind| !is_retryable_rpc_error(kind));

    if deterministic {
        RelayerError::TransactionSimulationFailed {
            message: format!("{context}: {error}"),
            inner_error: error,
        }
    } else {
        RelayerError::RpcError {
            message: format!("{context}: {error}"),
            inner_error: error,
        }
    }
}

/// Estimate plus a 10% buffer, clamped at `u64::MAX`
fn buffered_gas_limit(estimate: u64) -> u64 {
    estimate.saturating_add(estimate / 10)
}

#[cfg(test)]
mod tests {
    use alloy::{
        consensus::Transaction,
        primitives::{Address, U256, address},
    };
    use relayer_core::transaction::{
        TransactionIntent, Transaction1559Data, TransactionLegacyData,
    };

    use super::*;

    fn record(contract_address: Option<Address>) -> TransactionRecord {
        TransactionRecord::queued(TransactionIntent {
            chain_id: 137,
            wallet_address: address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
            account_address: None,
            contract_address,
            data: Bytes::from_static(&[0xde, 0xad]),
            value: U256::from(5),
            extension: None,
            gas_limit: None,
            fees: None,
        })
    }

    #[test]
    fn gas_buffer_adds_ten_percent_without_overflow() {
        assert_eq!(buffered_gas_limit(21_000), 23_100);
        assert_eq!(buffered_gas_limit(21_001), 23_101);
        assert_eq!(buffered_gas_limit(u64::MAX), u64::MAX);
        assert_eq!(buffered_gas_limit(u64::MAX / 10 * 10), u64::MAX);
    }

    const ESTIMATE: FeeValues = FeeValues::Eip1559 {
        max_fee_per_gas: 100,
        max_priority_fee_per_gas: 2,
    };

    #[test]
    fn overrides_win_over_estimates() {
        let overrides = TransactionTypeData::Eip1559(Transaction1559Data {
            max_fee_per_gas: Some(50),
            max_priority_fee_per_gas: None,
        });

        assert_eq!(
            resolve_fees(Some(&overrides), ESTIMATE),
            FeeValues::Eip1559 {
                max_fee_per_gas: 50,
                max_priority_fee_per_gas: 2,
            }
        );
    }

    #[test]
    fn estimated_priority_fee_is_kept_below_max_override() {
        let overrides = TransactionTypeData::Eip1559(Transaction1559Data {
            max_fee_per_gas: Some(1),
            max_priority_fee_per_gas: None,
        });

        assert_eq!(
            resolve_fees(Some(&overrides), ESTIMATE),
            FeeValues::Eip1559 {
                max_fee_per_gas: 1,
                max_priority_fee_per_gas: 1,
            }
        );
    }

    #[test]
    fn legacy_override_without_price_uses_estimate() {
        let overrides = TransactionTypeData::Legacy(TransactionLegacyData { gas_price: None });
        assert_eq!(
            resolve_fees(Some(&overrides), ESTIMATE),
            FeeValues::Legacy { gas_price: 100 }
        );
    }

    #[test]
    fn fully_specified_fees_skip_estimation() {
        let overrides = TransactionTypeData::Legacy(TransactionLegacyData {
            gas_price: Some(7),
        });
        assert_eq!(
            fees_fully_specified(Some(&overrides)),
            Some(FeeValues::Legacy { gas_price: 7 })
        );
        assert_eq!(fees_fully_specified(None), None);
    }

    #[test]
    fn deployment_builds_create_transaction() {
        let tx = build_typed_transaction(&record(None), 3, 21_000, ESTIMATE);
        assert_eq!(tx.kind(), TxKind::Create);
        assert_eq!(tx.nonce(), 3);
        assert_eq!(tx.chain_id(), Some(137));
    }

    #[test]
    fn legacy_fees_build_legacy_transaction() {
        let target = address!("0x0000000000000000000000000000000000000001");
        let tx = build_typed_transaction(
            &record(Some(target)),
            0,
            50_000,
            FeeValues::Legacy { gas_price: 9 },
        );

        match tx {
            TypedTransaction::Legacy(tx) => {
                assert_eq!(tx.gas_price, 9);
                assert_eq!(tx.to, TxKind::Call(target));
                assert_eq!(tx.value, U256::from(5));
            }
            other => panic!("expected legacy transaction, got {other:?}"),
        }
    }
}

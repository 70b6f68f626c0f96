use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

use crate::{
    defs::{AddressDef, BytesDef, U256Def, WeiDef},
    error::EngineError,
};

/// ### TransactionIntent
/// A write operation a client wants executed from one of the relayer's wallets.
#[derive(Deserialize, Serialize, Debug, Clone, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionIntent {
    /// Chain ID the transaction is sent on
    pub chain_id: u64,

    /// Wallet that signs and pays for the transaction
    #[schema(value_type = AddressDef)]
    pub wallet_address: Address,

    /// Smart account the call is executed through, if any
    #[schema(value_type = Option<AddressDef>)]
    #[serde(default)]
    pub account_address: Option<Address>,

    /// Target contract. Absent for contract deployments, in which case `data` is the init code.
    #[schema(value_type = Option<AddressDef>)]
    #[serde(default)]
    pub contract_address: Option<Address>,

    #[schema(value_type = BytesDef)]
    #[serde(default)]
    pub data: Bytes,

    #[schema(value_type = U256Def)]
    #[serde(default)]
    pub value: U256,

    /// Free-form classification of the call, used for filtering
    #[serde(default)]
    pub extension: Option<String>,

    /// Gas limit for the transaction
    /// If not provided, the relayer will estimate the gas limit
    #[serde(default)]
    pub gas_limit: Option<u64>,

    /// Fee overrides. Unset values are estimated at submission time.
    #[serde(default)]
    pub fees: Option<TransactionTypeData>,
}

impl TransactionIntent {
    pub fn is_deployment(&self) -> bool {
        self.contract_address.is_none()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.is_deployment() && self.data.is_empty() {
            return Err(EngineError::validation(
                "deployment transactions require init code in `data`",
            ));
        }

        if self.gas_limit == Some(0) {
            return Err(EngineError::validation("gasLimit must be greater than zero"));
        }

        if let Some(TransactionTypeData::Eip1559(Transaction1559Data {
            max_fee_per_gas: Some(max_fee),
            max_priority_fee_per_gas: Some(max_priority),
        })) = &self.fees
        {
            if max_priority > max_fee {
                return Err(EngineError::validation(
                    "maxPriorityFeePerGas cannot exceed maxFeePerGas",
                ));
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
#[schema(title = "Transaction Type Specific Data")]
pub enum TransactionTypeData {
    /// EIP-1559 transaction with priority fee and max fee per gas
    #[serde(rename = "eip1559")]
    Eip1559(Transaction1559Data),
    /// Legacy transaction with simple gas price
    #[serde(rename = "legacy")]
    Legacy(TransactionLegacyData),
}

/// EIP-1559 transaction configuration
/// Uses base fee + priority fee model for more predictable gas pricing
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(title = "EIP-1559 Specific Transaction Data")]
pub struct Transaction1559Data {
    /// Maximum fee per gas willing to pay (in wei)
    /// This is the total fee cap including base fee and priority fee
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[schema(value_type = Option<WeiDef>)]
    pub max_fee_per_gas: Option<u128>,

    /// Maximum priority fee per gas willing to pay (in wei)
    /// This is the tip paid to validators for transaction inclusion
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[schema(value_type = Option<WeiDef>)]
    pub max_priority_fee_per_gas: Option<u128>,
}

/// Legacy transaction configuration
/// Uses simple gas price model (pre-EIP-1559)
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(title = "Legacy Specific Transaction Data")]
pub struct TransactionLegacyData {
    /// Gas price willing to pay (in wei)
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[schema(value_type = Option<WeiDef>)]
    pub gas_price: Option<u128>,
}

/// Concrete fee values used for one broadcast attempt
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeeValues {
    #[serde(rename = "eip1559", rename_all = "camelCase")]
    Eip1559 {
        #[serde_as(as = "DisplayFromStr")]
        #[schema(value_type = WeiDef)]
        max_fee_per_gas: u128,
        #[serde_as(as = "DisplayFromStr")]
        #[schema(value_type = WeiDef)]
        max_priority_fee_per_gas: u128,
    },
    #[serde(rename = "legacy", rename_all = "camelCase")]
    Legacy {
        #[serde_as(as = "DisplayFromStr")]
        #[schema(value_type = WeiDef)]
        gas_price: u128,
    },
}

impl FeeValues {
    /// The per-gas amount the sender commits to at most
    pub fn max_fee(&self) -> u128 {
        match self {
            FeeValues::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
            FeeValues::Legacy { gas_price } => *gas_price,
        }
    }
}

impl std::fmt::Display for FeeValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeValues::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => write!(
                f,
                "maxFeePerGas={max_fee_per_gas} maxPriorityFeePerGas={max_priority_fee_per_gas}"
            ),
            FeeValues::Legacy { gas_price } => write!(f, "gasPrice={gas_price}"),
        }
    }
}

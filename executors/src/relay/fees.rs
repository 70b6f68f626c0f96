use relayer_core::{transaction::FeeValues, transaction_config::TransactionConfig};

/// Default bump applied to fees on every retry, in percent
pub const DEFAULT_FEE_BUMP_PERCENT: u32 = 20;

/// Computes the fees of the next attempt from the previous attempt and the
/// current network estimate. Caps are enforced afterwards by [`FeeCaps`], so a
/// policy never needs to know about them.
pub trait FeeEscalationPolicy: Send + Sync {
    fn escalate(&self, previous: &FeeValues, network: Option<&FeeValues>) -> FeeValues;
}

/// Raises every fee field by a fixed percentage over the higher of the last
/// attempt and the network estimate.
#[derive(Debug, Clone, Copy)]
pub struct PercentageBump {
    pub percent: u32,
}

impl Default for PercentageBump {
    fn default() -> Self {
        Self {
            percent: DEFAULT_FEE_BUMP_PERCENT,
        }
    }
}

impl PercentageBump {
    fn bump(&self, value: u128) -> u128 {
        let bumped = value.saturating_mul(100 + self.percent as u128) / 100;
        // Tiny values would otherwise round back to themselves
        if self.percent > 0 && bumped == value {
            value.saturating_add(1)
        } else {
            bumped
        }
    }
}

impl FeeEscalationPolicy for PercentageBump {
    fn escalate(&self, previous: &FeeValues, network: Option<&FeeValues>) -> FeeValues {
        match previous {
            FeeValues::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let (network_max, network_priority) = match network {
                    Some(FeeValues::Eip1559 {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                    }) => (*max_fee_per_gas, *max_priority_fee_per_gas),
                    Some(FeeValues::Legacy { gas_price }) => (*gas_price, 0),
                    None => (0, 0),
                };

                FeeValues::Eip1559 {
                    max_fee_per_gas: self.bump(*max_fee_per_gas).max(self.bump(network_max)),
                    max_priority_fee_per_gas: self
                        .bump(*max_priority_fee_per_gas)
                        .max(self.bump(network_priority)),
                }
            }
            FeeValues::Legacy { gas_price } => {
                let network_price = network.map(FeeValues::max_fee).unwrap_or_default();
                FeeValues::Legacy {
                    gas_price: self.bump(*gas_price).max(self.bump(network_price)),
                }
            }
        }
    }
}

/// Absolute upper bounds for escalated fees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeCaps {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl From<&TransactionConfig> for FeeCaps {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            max_fee_per_gas: config.max_fee_per_gas_for_retries,
            max_priority_fee_per_gas: config.max_priority_fee_per_gas_for_retries,
        }
    }
}

impl FeeCaps {
    /// Clamps every field. The priority fee never exceeds the resulting max fee.
    pub fn apply(&self, fees: FeeValues) -> FeeValues {
        match fees {
            FeeValues::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee_per_gas = max_fee_per_gas.min(self.max_fee_per_gas);
                FeeValues::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: max_priority_fee_per_gas
                        .min(self.max_priority_fee_per_gas)
                        .min(max_fee_per_gas),
                }
            }
            FeeValues::Legacy { gas_price } => FeeValues::Legacy {
                gas_price: gas_price.min(self.max_fee_per_gas),
            },
        }
    }
}

/// Next attempt's fees: policy first, caps last
pub fn escalate_fees(
    policy: &dyn FeeEscalationPolicy,
    caps: FeeCaps,
    previous: &FeeValues,
    network: Option<&FeeValues>,
) -> FeeValues {
    caps.apply(policy.escalate(previous, network))
}

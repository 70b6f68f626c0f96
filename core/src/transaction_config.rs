use std::{str::FromStr, sync::Arc};

use arc_swap::ArcSwap;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

use crate::{defs::WeiDef, error::EngineError};

/// 1 gwei in wei
const GWEI: u128 = 1_000_000_000;

/// Runtime tunables read by the submission, confirmation and retry loops.
///
/// A loop reads one snapshot at the start of a tick and uses it for the whole
/// tick, so an update never applies halfway through a run.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionConfig {
    /// Submission skips a tick when fewer than this many transactions are queued
    pub min_txs_to_process: u32,
    /// Upper bound of transactions broadcast in one submission tick
    pub max_txs_to_process: u32,
    /// Upper bound of submitted transactions polled in one confirmation run
    pub max_txs_to_update: u32,
    /// Blocks that must pass since the last broadcast before a retry
    pub min_ellapsed_blocks_before_retry: u64,
    /// Cap for escalated max fee per gas (and legacy gas price), in wei
    #[serde_as(as = "DisplayFromStr")]
    #[schema(value_type = WeiDef)]
    pub max_fee_per_gas_for_retries: u128,
    /// Cap for escalated max priority fee per gas, in wei
    #[serde_as(as = "DisplayFromStr")]
    #[schema(value_type = WeiDef)]
    pub max_priority_fee_per_gas_for_retries: u128,
    /// Rebroadcasts allowed per transaction before it is marked errored
    pub max_retries_per_tx: u32,
    /// Confirmation monitor cadence. `null` or empty disables the monitor.
    pub mined_tx_listener_cron_schedule: Option<String>,
    /// Retry engine cadence. `null` or empty disables the retry engine.
    pub retry_tx_listener_cron_schedule: Option<String>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            min_txs_to_process: 1,
            max_txs_to_process: 30,
            max_txs_to_update: 50,
            min_ellapsed_blocks_before_retry: 15,
            max_fee_per_gas_for_retries: 10_000 * GWEI,
            max_priority_fee_per_gas_for_retries: 1_000 * GWEI,
            max_retries_per_tx: 3,
            mined_tx_listener_cron_schedule: Some("*/5 * * * * *".to_string()),
            retry_tx_listener_cron_schedule: Some("*/30 * * * * *".to_string()),
        }
    }
}

/// Partial update, every field is optional. Schedule fields distinguish
/// "absent" (keep) from explicit `null` (disable).
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionConfigUpdate {
    pub min_txs_to_process: Option<u32>,
    pub max_txs_to_process: Option<u32>,
    pub max_txs_to_update: Option<u32>,
    pub min_ellapsed_blocks_before_retry: Option<u64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[schema(value_type = Option<WeiDef>)]
    pub max_fee_per_gas_for_retries: Option<u128>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[schema(value_type = Option<WeiDef>)]
    pub max_priority_fee_per_gas_for_retries: Option<u128>,
    pub max_retries_per_tx: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    #[schema(value_type = Option<String>)]
    pub mined_tx_listener_cron_schedule: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    #[schema(value_type = Option<String>)]
    pub retry_tx_listener_cron_schedule: Option<Option<String>>,
}

/// Parses a schedule expression. `None` and blank strings mean "disabled".
pub fn parse_schedule(expression: Option<&str>) -> Result<Option<Schedule>, EngineError> {
    match expression.map(str::trim) {
        None | Some("") => Ok(None),
        Some(expression) => Schedule::from_str(expression).map(Some).map_err(|e| {
            EngineError::validation(format!("Invalid cron expression '{expression}': {e}"))
        }),
    }
}

/// Blank schedules are stored as disabled
fn non_blank(schedule: &Option<String>) -> Option<String> {
    schedule
        .as_deref()
        .map(str::trim)
        .filter(|expression| !expression.is_empty())
        .map(str::to_string)
}

impl TransactionConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_txs_to_process == 0 {
            return Err(EngineError::validation("maxTxsToProcess must be at least 1"));
        }
        if self.min_txs_to_process > self.max_txs_to_process {
            return Err(EngineError::validation(format!(
                "minTxsToProcess ({}) cannot exceed maxTxsToProcess ({})",
                self.min_txs_to_process, self.max_txs_to_process
            )));
        }
        if self.max_txs_to_update == 0 {
            return Err(EngineError::validation("maxTxsToUpdate must be at least 1"));
        }
        if self.max_priority_fee_per_gas_for_retries > self.max_fee_per_gas_for_retries {
            return Err(EngineError::validation(
                "maxPriorityFeePerGasForRetries cannot exceed maxFeePerGasForRetries",
            ));
        }

        parse_schedule(self.mined_tx_listener_cron_schedule.as_deref())?;
        parse_schedule(self.retry_tx_listener_cron_schedule.as_deref())?;

        Ok(())
    }

    /// Returns a new config with the update applied. `self` is left untouched.
    pub fn apply(&self, update: &TransactionConfigUpdate) -> Result<Self, EngineError> {
        let mut next = self.clone();

        if let Some(value) = update.min_txs_to_process {
            next.min_txs_to_process = value;
        }
        if let Some(value) = update.max_txs_to_process {
            next.max_txs_to_process = value;
        }
        if let Some(value) = update.max_txs_to_update {
            next.max_txs_to_update = value;
        }
        if let Some(value) = update.min_ellapsed_blocks_before_retry {
            next.min_ellapsed_blocks_before_retry = value;
        }
        if let Some(value) = update.max_fee_per_gas_for_retries {
            next.max_fee_per_gas_for_retries = value;
        }
        if let Some(value) = update.max_priority_fee_per_gas_for_retries {
            next.max_priority_fee_per_gas_for_retries = value;
        }
        if let Some(value) = update.max_retries_per_tx {
            next.max_retries_per_tx = value;
        }
        if let Some(value) = &update.mined_tx_listener_cron_schedule {
            next.mined_tx_listener_cron_schedule = non_blank(value);
        }
        if let Some(value) = &update.retry_tx_listener_cron_schedule {
            next.retry_tx_listener_cron_schedule = non_blank(value);
        }

        next.validate()?;
        Ok(next)
    }
}

/// Shared, atomically swapped configuration snapshot
#[derive(Clone)]
pub struct TransactionConfigHandle {
    inner: Arc<ArcSwap<TransactionConfig>>,
}

impl TransactionConfigHandle {
    pub fn new(initial: TransactionConfig) -> Result<Self, EngineError> {
        initial.validate()?;
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        })
    }

    pub fn snapshot(&self) -> Arc<TransactionConfig> {
        self.inner.load_full()
    }

    /// Validates and installs the update as a whole. Concurrent updates are
    /// applied one after the other, never merged halfway.
    pub fn update(
        &self,
        update: &TransactionConfigUpdate,
    ) -> Result<Arc<TransactionConfig>, EngineError> {
        loop {
            let current = self.inner.load_full();
            let next = Arc::new(current.apply(update)?);
            let previous = self.inner.compare_and_swap(&current, next.clone());

            if Arc::ptr_eq(&*previous, &current) {
                tracing::info!(config = ?next, "Transaction configuration updated");
                return Ok(next);
            }
        }
    }
}

impl Default for TransactionConfigHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(TransactionConfig::default())),
        }
    }
}

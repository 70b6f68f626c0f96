use std::{sync::Arc, time::Duration};

use relayer_core::{
    error::EngineError,
    signer::TransactionSigner,
    transaction::TransactionIntent,
    transaction_config::TransactionConfigHandle,
};
use serde::{Deserialize, Serialize};

use crate::relay::{
    fees::{FeeEscalationPolicy, PercentageBump},
    ledger::LedgerService,
    nonce_manager::NonceManager,
    store::{
        TransactionRecord, TransactionStatus, TransactionStore, TransactionStoreError, WalletKey,
        modify_record,
    },
};

pub mod confirm;
pub mod error;
pub mod retry;
mod send;
pub mod transaction;

use error::RelayerError;

/// Store lease held by the process that drives the schedulers
pub const WORKER_LEASE_NAME: &str = "worker_lease";
const DEFAULT_WORKER_LEASE_TTL: Duration = Duration::from_secs(60);

// ========== RUN REPORTS ==========
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReport {
    /// Tick skipped because fewer than the minimum were queued or another
    /// process holds the worker lease
    pub skipped: bool,
    /// Borrowed payloads rebroadcast after a crash
    pub recovered_transactions: u32,
    /// Records picked for this tick
    pub selected_transactions: u32,
    /// Records moved to `submitted`
    pub sent_transactions: u32,
    /// Records left `queued` for the next tick
    pub requeued_transactions: u32,
    /// Records moved to `errored`
    pub failed_transactions: u32,
    /// Wallets skipped because their nonces need reconciling
    pub conflicted_wallets: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationReport {
    pub skipped: bool,
    pub checked_transactions: u32,
    pub mined_transactions: u32,
    pub reverted_transactions: u32,
    pub pending_transactions: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub skipped: bool,
    /// Submitted records old enough to be looked at
    pub stale_transactions: u32,
    pub retried_transactions: u32,
    /// Records that exhausted their retries
    pub failed_transactions: u32,
}

// ========== MAIN WORKER ==========
/// Relay worker
///
/// ## Passes:
/// 1. **Submission** - recovers borrowed payloads, then assigns nonces to queued
///    records and broadcasts them, serially per wallet and concurrently across wallets
/// 2. **Confirmation** - polls receipts of submitted records and finalizes them
/// 3. **Retry** - rebroadcasts stale submitted records with the same nonce and
///    escalated fees, or marks them errored once retries run out
///
/// Every pass reads one configuration snapshot up front and uses it throughout.
pub struct RelayWorker<S, L, G> {
    pub store: Arc<S>,
    pub ledgers: Arc<L>,
    pub signer: Arc<G>,
    pub nonces: Arc<NonceManager<S>>,
    pub config: TransactionConfigHandle,
    pub fee_policy: Arc<dyn FeeEscalationPolicy>,

    pub instance_id: String,
    pub worker_lease_ttl: Duration,
}

impl<S, L, G> Clone for RelayWorker<S, L, G> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ledgers: self.ledgers.clone(),
            signer: self.signer.clone(),
            nonces: self.nonces.clone(),
            config: self.config.clone(),
            fee_policy: self.fee_policy.clone(),
            instance_id: self.instance_id.clone(),
            worker_lease_ttl: self.worker_lease_ttl,
        }
    }
}

impl<S, L, G> RelayWorker<S, L, G>
where
    S: TransactionStore,
    L: LedgerService,
    G: TransactionSigner,
{
    pub fn new(
        store: Arc<S>,
        ledgers: Arc<L>,
        signer: Arc<G>,
        config: TransactionConfigHandle,
    ) -> Self {
        Self {
            nonces: Arc::new(NonceManager::new(store.clone())),
            store,
            ledgers,
            signer,
            config,
            fee_policy: Arc::new(PercentageBump::default()),
            instance_id: uuid::Uuid::new_v4().to_string(),
            worker_lease_ttl: DEFAULT_WORKER_LEASE_TTL,
        }
    }

    pub fn with_fee_policy(mut self, policy: impl FeeEscalationPolicy + 'static) -> Self {
        self.fee_policy = Arc::new(policy);
        self
    }

    pub fn with_worker_lease_ttl(mut self, ttl: Duration) -> Self {
        self.worker_lease_ttl = ttl;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Takes or extends the worker lease. Passes do nothing without it.
    pub async fn hold_worker_lease(&self) -> Result<bool, RelayerError> {
        let held = self
            .store
            .acquire_lease(WORKER_LEASE_NAME, &self.instance_id, self.worker_lease_ttl)
            .await?;

        if !held {
            tracing::debug!(
                instance_id = %self.instance_id,
                "Worker lease held by another instance, skipping pass"
            );
        }

        Ok(held)
    }

    pub async fn release_worker_lease(&self) -> Result<(), RelayerError> {
        self.store
            .release_lease(WORKER_LEASE_NAME, &self.instance_id)
            .await?;
        Ok(())
    }

    /// Validates an intent and stores it as a `queued` record
    pub async fn queue_transaction(
        &self,
        intent: TransactionIntent,
    ) -> Result<TransactionRecord, EngineError> {
        intent.validate()?;

        if !self.signer.has_wallet(&intent.wallet_address) {
            return Err(EngineError::validation(format!(
                "No signing key configured for wallet {}",
                intent.wallet_address
            )));
        }

        self.ledgers.ledger(intent.chain_id)?;

        let record = TransactionRecord::queued(intent);
        self.store.insert(&record).await?;

        tracing::info!(
            transaction_id = %record.id,
            chain_id = record.chain_id,
            wallet = %record.wallet_address,
            "Transaction queued"
        );
        Ok(record)
    }

    /// Cancels a queued record, or stops retrying a broadcast one.
    ///
    /// A record that already holds a nonce is on its way to the network, so it
    /// only gets flagged; the submission and retry passes honour the flag.
    pub async fn cancel_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<TransactionRecord, TransactionStoreError> {
        let updated = modify_record(self.store.as_ref(), transaction_id, |current| {
            match current.status {
                TransactionStatus::Queued if current.nonce.is_none() => {
                    let mut next = current.clone();
                    next.status = TransactionStatus::Cancelled;
                    Ok(Some(next))
                }
                TransactionStatus::Queued | TransactionStatus::Submitted => {
                    if current.cancel_requested {
                        return Ok(None);
                    }
                    let mut next = current.clone();
                    next.cancel_requested = true;
                    Ok(Some(next))
                }
                status => Err(TransactionStoreError::IllegalTransition {
                    transaction_id: current.id.clone(),
                    from: status,
                    to: TransactionStatus::Cancelled,
                }),
            }
        })
        .await?;

        let record = match updated {
            Some(record) => record,
            None => self.store.get(transaction_id).await?.ok_or_else(|| {
                TransactionStoreError::TransactionNotFound {
                    transaction_id: transaction_id.to_string(),
                }
            })?,
        };

        tracing::info!(
            transaction_id = %record.id,
            status = %record.status,
            cancel_requested = record.cancel_requested,
            "Cancellation processed"
        );
        Ok(record)
    }

    /// Operator reset of a wallet's nonce bookkeeping
    pub async fn reset_nonces(&self, wallet: WalletKey) -> Result<(), RelayerError> {
        self.nonces.reset(wallet).await?;
        Ok(())
    }
}

/// Groups records by wallet, keeping queue order inside each group and
/// ordering groups by their first record
pub(crate) fn group_by_wallet(
    records: Vec<TransactionRecord>,
) -> Vec<(WalletKey, Vec<TransactionRecord>)> {
    let mut groups: Vec<(WalletKey, Vec<TransactionRecord>)> = Vec::new();

    for record in records {
        let wallet = record.wallet_key();
        match groups.iter_mut().find(|(key, _)| *key == wallet) {
            Some((_, group)) => group.push(record),
            None => groups.push((wallet, vec![record])),
        }
    }

    groups
}

/// Groups records by chain, same ordering rules as [`group_by_wallet`]
pub(crate) fn group_by_chain(
    records: Vec<TransactionRecord>,
) -> Vec<(u64, Vec<TransactionRecord>)> {
    let mut groups: Vec<(u64, Vec<TransactionRecord>)> = Vec::new();

    for record in records {
        match groups.iter_mut().find(|(chain_id, _)| *chain_id == record.chain_id) {
            Some((_, group)) => group.push(record),
            None => groups.push((record.chain_id, vec![record])),
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, Bytes, address};

    use super::*;

    fn record(chain_id: u64, wallet: Address) -> TransactionRecord {
        TransactionRecord::queued(TransactionIntent {
            chain_id,
            wallet_address: wallet,
            account_address: None,
            contract_address: Some(Address::ZERO),
            data: Bytes::new(),
            value: Default::default(),
            extension: None,
            gas_limit: None,
            fees: None,
        })
    }

    #[test]
    fn grouping_keeps_queue_order() {
        let a = address!("0x00000000000000000000000000000000000000aa");
        let b = address!("0x00000000000000000000000000000000000000bb");
        let records = vec![record(1, a), record(1, b), record(1, a), record(2, a)];
        let ids: Vec<_> = records.iter().map(|r| r.id.clone()).collect();

        let groups = group_by_wallet(records);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].0.wallet, a);
        assert_eq!(
            groups[0].1.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            vec![ids[0].clone(), ids[2].clone()]
        );
        assert_eq!(groups[2].0.chain_id, 2);
    }

    #[test]
    fn chain_grouping() {
        let a = address!("0x00000000000000000000000000000000000000aa");
        let groups = group_by_chain(vec![record(5, a), record(1, a), record(5, a)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, 5);
        assert_eq!(groups[0].1.len(), 2);
    }
}

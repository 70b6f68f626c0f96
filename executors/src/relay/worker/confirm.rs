use futures::future::join_all;
use relayer_core::{error::EngineError, signer::TransactionSigner};

use crate::relay::{
    ledger::{Ledger, LedgerService, ReceiptOutcome},
    store::{TransactionRecord, TransactionStatus, TransactionStore, modify_record, now_millis},
    worker::{ConfirmationReport, RelayWorker, error::RelayerError, group_by_chain},
};

/// Looks up receipts for every hash a record was broadcast under, newest
/// first. Any replacement may be the one that got mined.
pub(crate) async fn find_receipt<Lg: Ledger>(
    ledger: &Lg,
    record: &TransactionRecord,
) -> Result<Option<ReceiptOutcome>, EngineError> {
    let mut hashes: Vec<_> = record.attempts.iter().rev().map(|a| a.hash).collect();
    if let Some(hash) = record.transaction_hash {
        if !hashes.contains(&hash) {
            hashes.insert(0, hash);
        }
    }

    for hash in hashes {
        if let Some(receipt) = ledger.receipt(hash).await? {
            return Ok(Some(receipt));
        }
    }

    Ok(None)
}

impl ConfirmationReport {
    fn absorb(&mut self, other: ConfirmationReport) {
        self.mined_transactions += other.mined_transactions;
        self.reverted_transactions += other.reverted_transactions;
        self.pending_transactions += other.pending_transactions;
    }
}

impl<S, L, G> RelayWorker<S, L, G>
where
    S: TransactionStore,
    L: LedgerService,
    G: TransactionSigner,
{
    /// One confirmation run. Only observes the ledger, never fees or retries.
    #[tracing::instrument(name = "confirmation_pass", skip_all, fields(instance_id = %self.instance_id))]
    pub async fn run_confirmation(&self) -> Result<ConfirmationReport, RelayerError> {
        let config = self.config.snapshot();
        let mut report = ConfirmationReport::default();

        if !self.hold_worker_lease().await? {
            report.skipped = true;
            return Ok(report);
        }

        let records = self
            .store
            .list_by_status(
                TransactionStatus::Submitted,
                config.max_txs_to_update as usize,
            )
            .await?;
        report.checked_transactions = records.len() as u32;

        let chain_reports = join_all(
            group_by_chain(records)
                .into_iter()
                .map(|(chain_id, records)| self.confirm_chain_batch(chain_id, records)),
        )
        .await;

        for chain_report in chain_reports {
            report.absorb(chain_report);
        }

        if report.checked_transactions > 0 {
            tracing::info!(
                checked = report.checked_transactions,
                mined = report.mined_transactions,
                reverted = report.reverted_transactions,
                pending = report.pending_transactions,
                "Confirmation run finished"
            );
        }
        Ok(report)
    }

    async fn confirm_chain_batch(
        &self,
        chain_id: u64,
        records: Vec<TransactionRecord>,
    ) -> ConfirmationReport {
        let mut report = ConfirmationReport::default();

        let ledger = match self.ledgers.ledger(chain_id) {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!(chain_id = chain_id, error = %e, "No ledger for chain");
                report.pending_transactions = records.len() as u32;
                return report;
            }
        };

        for record in records {
            let receipt = match find_receipt(&ledger, &record).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => {
                    report.pending_transactions += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        transaction_id = %record.id,
                        error = %e,
                        "Failed to fetch receipt, retrying next run"
                    );
                    report.pending_transactions += 1;
                    continue;
                }
            };

            match self.finalize_record(&record.id, &receipt).await {
                Ok(Some(finalized)) if finalized.status == TransactionStatus::Mined => {
                    report.mined_transactions += 1;
                }
                Ok(Some(_)) => report.reverted_transactions += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(
                    transaction_id = %record.id,
                    error = %e,
                    "Failed to record receipt"
                ),
            }
        }

        report
    }

    /// Moves a submitted record to `mined` or `reverted`. A record that is no
    /// longer submitted is left alone, so repeated runs are no-ops.
    pub(crate) async fn finalize_record(
        &self,
        transaction_id: &str,
        receipt: &ReceiptOutcome,
    ) -> Result<Option<TransactionRecord>, RelayerError> {
        let finalized = modify_record(self.store.as_ref(), transaction_id, |current| {
            if current.status != TransactionStatus::Submitted {
                return Ok(None);
            }

            let mut next = current.clone();
            next.status = if receipt.success {
                TransactionStatus::Mined
            } else {
                TransactionStatus::Reverted
            };
            next.transaction_hash = Some(receipt.hash);
            next.mined_at = Some(now_millis());
            next.mined_block = receipt.block_number;
            next.gas_used = Some(receipt.gas_used);

            if current.is_deployment() {
                next.deployed_contract_address = receipt.contract_address;
            }

            if !receipt.success {
                next.error_message = Some(format!(
                    "Transaction {} reverted on-chain",
                    receipt.hash
                ));
            }

            Ok(Some(next))
        })
        .await?;

        if let Some(record) = &finalized {
            tracing::info!(
                transaction_id = %record.id,
                status = %record.status,
                hash = %receipt.hash,
                block_number = ?receipt.block_number,
                "Transaction finalized"
            );
        }

        Ok(finalized)
    }
}

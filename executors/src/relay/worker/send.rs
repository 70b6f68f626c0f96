use alloy::primitives::B256;
use futures::future::join_all;
use relayer_core::{error::EngineError, signer::TransactionSigner};

use crate::relay::{
    ledger::{Ledger, LedgerService},
    nonce_manager::{NonceError, WalletLease},
    store::{
        BorrowedTransaction, TransactionRecord, TransactionStatus, TransactionStore,
        TransactionStoreError, WalletKey, modify_record, now_millis,
    },
    worker::{
        RelayWorker, SubmissionReport, group_by_wallet,
        error::{RelayerError, SendContext, SendErrorClassification, classify_send_error},
    },
};

/// What happened to one record in a submission tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitOutcome {
    Sent,
    Requeued,
    Failed,
    /// Cancelled or moved on by someone else while we worked on it
    Skipped,
}

impl SubmissionReport {
    fn absorb(&mut self, other: SubmissionReport) {
        self.sent_transactions += other.sent_transactions;
        self.requeued_transactions += other.requeued_transactions;
        self.failed_transactions += other.failed_transactions;
        self.conflicted_wallets += other.conflicted_wallets;
    }

    fn record(&mut self, outcome: SubmitOutcome) {
        match outcome {
            SubmitOutcome::Sent => self.sent_transactions += 1,
            SubmitOutcome::Requeued => self.requeued_transactions += 1,
            SubmitOutcome::Failed => self.failed_transactions += 1,
            SubmitOutcome::Skipped => {}
        }
    }
}

impl<S, L, G> RelayWorker<S, L, G>
where
    S: TransactionStore,
    L: LedgerService,
    G: TransactionSigner,
{
    /// One submission tick
    #[tracing::instrument(name = "submission_pass", skip_all, fields(instance_id = %self.instance_id))]
    pub async fn run_submission(&self) -> Result<SubmissionReport, RelayerError> {
        let config = self.config.snapshot();
        let mut report = SubmissionReport::default();

        if !self.hold_worker_lease().await? {
            report.skipped = true;
            return Ok(report);
        }

        let queued = self.store.count_by_status(TransactionStatus::Queued).await?;
        if queued < config.min_txs_to_process as u64 {
            tracing::debug!(
                queued = queued,
                min_txs_to_process = config.min_txs_to_process,
                "Not enough queued transactions, skipping tick"
            );
            report.skipped = true;
            return Ok(report);
        }

        // Recovered payloads go out before any new nonce is handed out
        report.recovered_transactions = self.recover_borrowed_transactions().await?;

        let records = self
            .store
            .list_by_status(
                TransactionStatus::Queued,
                config.max_txs_to_process as usize,
            )
            .await?;
        report.selected_transactions = records.len() as u32;

        let wallet_reports = join_all(
            group_by_wallet(records)
                .into_iter()
                .map(|(wallet, records)| self.submit_wallet_batch(wallet, records)),
        )
        .await;

        for wallet_report in wallet_reports {
            report.absorb(wallet_report);
        }

        tracing::info!(
            selected = report.selected_transactions,
            sent = report.sent_transactions,
            requeued = report.requeued_transactions,
            failed = report.failed_transactions,
            recovered = report.recovered_transactions,
            "Submission tick finished"
        );
        Ok(report)
    }

    /// Sends one wallet's records in queue order. Anything that could break
    /// nonce ordering stops the batch and leaves the rest for the next tick.
    #[tracing::instrument(skip_all, fields(wallet = %wallet, count = records.len()))]
    async fn submit_wallet_batch(
        &self,
        wallet: WalletKey,
        records: Vec<TransactionRecord>,
    ) -> SubmissionReport {
        let mut report = SubmissionReport::default();
        let total = records.len() as u32;

        let ledger = match self.ledgers.ledger(wallet.chain_id) {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!(error = %e, "No ledger for chain, leaving records queued");
                report.requeued_transactions = total;
                return report;
            }
        };

        let lease = self.nonces.lease(wallet).await;

        if let Err(e) = self.nonces.reconcile(&lease, &ledger).await {
            match &e {
                NonceError::AllocationConflict { .. } => {
                    tracing::error!(
                        error = %e,
                        "Nonce allocation conflict, wallet pipeline halted until reconciled"
                    );
                    report.conflicted_wallets = 1;
                }
                _ => tracing::warn!(error = %e, "Failed to reconcile nonces, retrying next tick"),
            }
            report.requeued_transactions = total;
            return report;
        }

        let block_number = match ledger.block_number().await {
            Ok(block_number) => block_number,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read block number, retrying next tick");
                report.requeued_transactions = total;
                return report;
            }
        };

        let mut remaining = records.into_iter();
        while let Some(record) = remaining.next() {
            let transaction_id = record.id.clone();

            match self
                .submit_record(&lease, &ledger, record, block_number)
                .await
            {
                Ok(SubmitOutcome::Requeued) => {
                    report.requeued_transactions += 1 + remaining.len() as u32;
                    break;
                }
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::warn!(
                        transaction_id = %transaction_id,
                        error = %e,
                        "Submission failed, leaving wallet batch for next tick"
                    );
                    report.requeued_transactions += 1 + remaining.len() as u32;
                    break;
                }
            }
        }

        report
    }

    async fn submit_record(
        &self,
        lease: &WalletLease,
        ledger: &L::Ledger,
        record: TransactionRecord,
        block_number: u64,
    ) -> Result<SubmitOutcome, RelayerError> {
        let prepared = match self.prepare_transaction(ledger, &record).await {
            Ok(prepared) => prepared,
            Err(e) if e.is_deterministic() => {
                tracing::warn!(transaction_id = %record.id, error = %e, "Transaction preparation failed");
                self.fail_queued(lease, &record.id, record.nonce, &e).await?;
                return Ok(SubmitOutcome::Failed);
            }
            Err(e) => return Err(e),
        };

        let nonce = match record.nonce {
            Some(nonce) => nonce,
            None => self.nonces.allocate(lease, ledger).await?,
        };

        let signed = match self
            .sign_transaction(&record, nonce, prepared.gas_limit, prepared.fees)
            .await
        {
            Ok(signed) => signed,
            Err(e) if e.is_deterministic() => {
                tracing::error!(transaction_id = %record.id, error = %e, "Transaction signing failed");
                self.fail_queued(lease, &record.id, Some(nonce), &e).await?;
                return Ok(SubmitOutcome::Failed);
            }
            Err(e) => {
                if record.nonce.is_none() {
                    self.nonces.release(lease, nonce).await?;
                }
                return Err(e);
            }
        };

        // Claim the nonce on the record before anything leaves the process
        let mut cancelled = false;
        let claimed = modify_record(self.store.as_ref(), &record.id, |current| {
            cancelled = false;
            if current.status != TransactionStatus::Queued {
                return Ok(None);
            }
            if current.nonce.is_some_and(|held| held != nonce) {
                return Err(TransactionStoreError::InternalError {
                    message: format!(
                        "record {} holds nonce {:?}, expected {nonce}",
                        current.id, current.nonce
                    ),
                });
            }

            let mut next = current.clone();
            if current.cancel_requested {
                cancelled = true;
                next.status = TransactionStatus::Cancelled;
                next.nonce = None;
            } else {
                next.nonce = Some(nonce);
            }
            Ok(Some(next))
        })
        .await;

        let claimed = match claimed {
            Ok(claimed) => claimed,
            Err(e) => {
                self.release_unless_held(lease, &record.id, nonce).await;
                return Err(e.into());
            }
        };

        if claimed.is_none() || cancelled {
            self.nonces.release(lease, nonce).await?;
            tracing::info!(transaction_id = %record.id, "Transaction cancelled before broadcast");
            return Ok(SubmitOutcome::Skipped);
        }

        let borrowed = BorrowedTransaction {
            transaction_id: record.id.clone(),
            chain_id: record.chain_id,
            wallet_address: record.wallet_address,
            nonce,
            raw: signed.raw,
            hash: signed.hash,
            fees: prepared.fees,
            gas_limit: prepared.gas_limit,
            block_number,
            borrowed_at: now_millis(),
        };
        self.store.put_borrowed(&borrowed).await?;

        let result = ledger.send_raw_transaction(&borrowed.raw).await;
        self.settle_broadcast(lease, &borrowed, result, SendContext::InitialBroadcast)
            .await
    }

    /// Applies a broadcast result to the record behind a borrowed payload and
    /// clears the borrowed entry once the record reflects it
    async fn settle_broadcast(
        &self,
        lease: &WalletLease,
        borrowed: &BorrowedTransaction,
        result: Result<B256, EngineError>,
        context: SendContext,
    ) -> Result<SubmitOutcome, RelayerError> {
        let outcome = match result {
            Ok(_) => self.commit_submitted(borrowed).await?,
            Err(e) => match classify_send_error(&e, context) {
                SendErrorClassification::PossiblySent => {
                    tracing::warn!(
                        transaction_id = %borrowed.transaction_id,
                        nonce = borrowed.nonce,
                        error = %e,
                        "Broadcast result ambiguous, assuming sent"
                    );
                    self.commit_submitted(borrowed).await?
                }
                SendErrorClassification::DeterministicFailure => {
                    tracing::warn!(
                        transaction_id = %borrowed.transaction_id,
                        nonce = borrowed.nonce,
                        error = %e,
                        "Broadcast rejected, record stays queued"
                    );
                    self.unclaim(lease, borrowed, &e).await?
                }
                SendErrorClassification::DeterministicFailureNonRetryable => {
                    tracing::error!(
                        transaction_id = %borrowed.transaction_id,
                        nonce = borrowed.nonce,
                        error = %e,
                        "Broadcast rejected permanently"
                    );
                    let error = RelayerError::TransactionSendError {
                        message: format!("Transaction send failed: {e}"),
                        inner_error: e,
                    };
                    self.fail_queued(
                        lease,
                        &borrowed.transaction_id,
                        Some(borrowed.nonce),
                        &error,
                    )
                    .await?;
                    SubmitOutcome::Failed
                }
            },
        };

        self.store
            .remove_borrowed(&borrowed.transaction_id)
            .await?;
        Ok(outcome)
    }

    async fn commit_submitted(
        &self,
        borrowed: &BorrowedTransaction,
    ) -> Result<SubmitOutcome, RelayerError> {
        let committed = modify_record(self.store.as_ref(), &borrowed.transaction_id, |current| {
            if current.status != TransactionStatus::Queued {
                return Ok(None);
            }

            let mut next = current.clone();
            next.status = TransactionStatus::Submitted;
            next.nonce = Some(borrowed.nonce);
            next.gas_limit = Some(borrowed.gas_limit);
            next.transaction_hash = Some(borrowed.hash);
            next.attempts
                .push(borrowed.attempt(current.attempts.len() as u32 + 1));
            next.submitted_at = Some(now_millis());
            next.sent_at_block = Some(borrowed.block_number);
            next.error_message = None;
            Ok(Some(next))
        })
        .await?;

        Ok(match committed {
            Some(record) => {
                tracing::info!(
                    transaction_id = %record.id,
                    nonce = borrowed.nonce,
                    hash = %borrowed.hash,
                    "Transaction submitted"
                );
                SubmitOutcome::Sent
            }
            None => SubmitOutcome::Skipped,
        })
    }

    /// Puts the record back in the queue without a nonce and frees the nonce
    async fn unclaim(
        &self,
        lease: &WalletLease,
        borrowed: &BorrowedTransaction,
        error: &EngineError,
    ) -> Result<SubmitOutcome, RelayerError> {
        let mut cancelled = false;
        modify_record(self.store.as_ref(), &borrowed.transaction_id, |current| {
            cancelled = false;
            if current.status != TransactionStatus::Queued {
                return Ok(None);
            }

            let mut next = current.clone();
            next.nonce = None;
            next.error_message = Some(error.to_string());
            if current.cancel_requested {
                cancelled = true;
                next.status = TransactionStatus::Cancelled;
            }
            Ok(Some(next))
        })
        .await?;

        self.nonces.release(lease, borrowed.nonce).await?;

        Ok(if cancelled {
            SubmitOutcome::Skipped
        } else {
            SubmitOutcome::Requeued
        })
    }

    /// Frees a freshly allocated nonce after a failed claim, unless the claim
    /// made it to the store after all
    async fn release_unless_held(&self, lease: &WalletLease, transaction_id: &str, nonce: u64) {
        match self.store.get(transaction_id).await {
            Ok(Some(record)) if record.nonce == Some(nonce) => {}
            Ok(_) => {
                if let Err(e) = self.nonces.release(lease, nonce).await {
                    tracing::warn!(nonce = nonce, error = %e, "Failed to release nonce");
                }
            }
            Err(e) => tracing::warn!(
                transaction_id = transaction_id,
                nonce = nonce,
                error = %e,
                "Could not verify nonce claim, leaving nonce for reconciliation"
            ),
        }
    }

    /// Moves a queued record to `errored` and frees any nonce it held
    async fn fail_queued(
        &self,
        lease: &WalletLease,
        transaction_id: &str,
        nonce: Option<u64>,
        error: &RelayerError,
    ) -> Result<(), RelayerError> {
        modify_record(self.store.as_ref(), transaction_id, |current| {
            if current.status != TransactionStatus::Queued {
                return Ok(None);
            }

            let mut next = current.clone();
            next.status = TransactionStatus::Errored;
            next.nonce = None;
            next.error_message = Some(error.to_string());
            Ok(Some(next))
        })
        .await?;

        if let Some(nonce) = nonce {
            self.nonces.release(lease, nonce).await?;
        }
        Ok(())
    }

    /// Rebroadcasts payloads left behind by a crash between broadcast and the
    /// record update, then settles them like a fresh broadcast
    async fn recover_borrowed_transactions(&self) -> Result<u32, RelayerError> {
        let borrowed_transactions = self.store.list_borrowed().await?;
        let mut recovered = 0;

        for borrowed in borrowed_transactions {
            let still_queued = self
                .store
                .get(&borrowed.transaction_id)
                .await?
                .is_some_and(|record| record.status == TransactionStatus::Queued);

            if !still_queued {
                self.store
                    .remove_borrowed(&borrowed.transaction_id)
                    .await?;
                continue;
            }

            let ledger = match self.ledgers.ledger(borrowed.chain_id) {
                Ok(ledger) => ledger,
                Err(e) => {
                    tracing::warn!(
                        transaction_id = %borrowed.transaction_id,
                        error = %e,
                        "No ledger for borrowed transaction, retrying next tick"
                    );
                    continue;
                }
            };

            let lease = self.nonces.lease(borrowed.wallet_key()).await;
            let result = ledger.send_raw_transaction(&borrowed.raw).await;

            match self
                .settle_broadcast(&lease, &borrowed, result, SendContext::Rebroadcast)
                .await
            {
                Ok(outcome) => {
                    tracing::info!(
                        transaction_id = %borrowed.transaction_id,
                        nonce = borrowed.nonce,
                        outcome = ?outcome,
                        "Recovered borrowed transaction"
                    );
                    recovered += 1;
                }
                Err(e) => tracing::warn!(
                    transaction_id = %borrowed.transaction_id,
                    error = %e,
                    "Failed to recover borrowed transaction"
                ),
            }
        }

        Ok(recovered)
    }
}

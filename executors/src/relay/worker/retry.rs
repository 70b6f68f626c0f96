use futures::future::join_all;
use relayer_core::{
    signer::TransactionSigner, transaction::FeeValues, transaction_config::TransactionConfig,
};

use crate::relay::{
    fees::{FeeCaps, escalate_fees},
    ledger::{Ledger, LedgerService},
    nonce_manager::WalletLease,
    store::{
        TransactionAttempt, TransactionRecord, TransactionStatus, TransactionStore, modify_record,
        now_millis,
    },
    worker::{
        RelayWorker, RetryReport, group_by_chain, group_by_wallet,
        confirm::find_receipt,
        error::{RelayerError, SendContext, SendErrorClassification, classify_send_error},
    },
};

/// Submitted records looked at per retry run, oldest first
const MAX_RETRY_SCAN: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryOutcome {
    Retried,
    Exhausted,
    /// Mined, cancelled, or changed concurrently
    Skipped,
}

/// Whether enough blocks passed since the last broadcast
pub fn is_stale(record: &TransactionRecord, block_number: u64, min_elapsed_blocks: u64) -> bool {
    let sent_at_block = record.sent_at_block.unwrap_or_default();
    block_number.saturating_sub(sent_at_block) > min_elapsed_blocks
}

fn exhaustion_message(retry_count: u32, last_fees: Option<&FeeValues>) -> String {
    match last_fees {
        Some(fees) => format!("Retries exhausted after {retry_count} retries, last fees: {fees}"),
        None => format!("Retries exhausted after {retry_count} retries"),
    }
}

fn cancellation_message(retry_count: u32) -> String {
    format!("Cancelled, retries stopped after {retry_count} retries without a receipt")
}

/// Why a submitted record leaves the retry loop without a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Exhausted,
    Cancelled,
}

impl RetryReport {
    fn absorb(&mut self, other: RetryReport) {
        self.stale_transactions += other.stale_transactions;
        self.retried_transactions += other.retried_transactions;
        self.failed_transactions += other.failed_transactions;
    }
}

impl<S, L, G> RelayWorker<S, L, G>
where
    S: TransactionStore,
    L: LedgerService,
    G: TransactionSigner,
{
    /// One retry run
    #[tracing::instrument(name = "retry_pass", skip_all, fields(instance_id = %self.instance_id))]
    pub async fn run_retry(&self) -> Result<RetryReport, RelayerError> {
        let config = self.config.snapshot();
        let mut report = RetryReport::default();

        if !self.hold_worker_lease().await? {
            report.skipped = true;
            return Ok(report);
        }

        let records = self
            .store
            .list_by_status(TransactionStatus::Submitted, MAX_RETRY_SCAN)
            .await?;

        let chain_reports = join_all(
            group_by_chain(records)
                .into_iter()
                .map(|(chain_id, records)| self.retry_chain_batch(chain_id, records, &config)),
        )
        .await;

        for chain_report in chain_reports {
            report.absorb(chain_report);
        }

        if report.stale_transactions > 0 {
            tracing::info!(
                stale = report.stale_transactions,
                retried = report.retried_transactions,
                failed = report.failed_transactions,
                "Retry run finished"
            );
        }
        Ok(report)
    }

    async fn retry_chain_batch(
        &self,
        chain_id: u64,
        records: Vec<TransactionRecord>,
        config: &TransactionConfig,
    ) -> RetryReport {
        let mut report = RetryReport::default();

        let ledger = match self.ledgers.ledger(chain_id) {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!(chain_id = chain_id, error = %e, "No ledger for chain");
                return report;
            }
        };

        let block_number = match ledger.block_number().await {
            Ok(block_number) => block_number,
            Err(e) => {
                tracing::warn!(chain_id = chain_id, error = %e, "Failed to read block number");
                return report;
            }
        };

        let stale: Vec<_> = records
            .into_iter()
            .filter(|record| {
                is_stale(record, block_number, config.min_ellapsed_blocks_before_retry)
            })
            .collect();
        report.stale_transactions = stale.len() as u32;

        let wallet_reports = join_all(group_by_wallet(stale).into_iter().map(
            |(wallet, records)| {
                let ledger = &ledger;
                async move {
                    let mut report = RetryReport::default();
                    let lease = self.nonces.lease(wallet).await;

                    for record in records {
                        match self
                            .retry_record(&lease, ledger, &record.id, block_number, config)
                            .await
                        {
                            Ok(RetryOutcome::Retried) => report.retried_transactions += 1,
                            Ok(RetryOutcome::Exhausted) => report.failed_transactions += 1,
                            Ok(RetryOutcome::Skipped) => {}
                            Err(e) => tracing::warn!(
                                transaction_id = %record.id,
                                error = %e,
                                "Retry failed, will try again next run"
                            ),
                        }
                    }

                    report
                }
            },
        ))
        .await;

        for wallet_report in wallet_reports {
            report.absorb(wallet_report);
        }

        report
    }

    /// Rebroadcasts one stale record with the same nonce and escalated fees,
    /// or marks it errored once its retries are used up. Runs under the
    /// wallet lease so it never interleaves with a submission for that wallet.
    async fn retry_record(
        &self,
        _lease: &WalletLease,
        ledger: &L::Ledger,
        transaction_id: &str,
        block_number: u64,
        config: &TransactionConfig,
    ) -> Result<RetryOutcome, RelayerError> {
        let Some(current) = self.store.get(transaction_id).await? else {
            return Ok(RetryOutcome::Skipped);
        };

        if current.status != TransactionStatus::Submitted {
            return Ok(RetryOutcome::Skipped);
        }

        // A mined record belongs to the confirmation monitor
        let receipt = find_receipt(ledger, &current)
            .await
            .map_err(|e| RelayerError::RpcError {
                message: format!("Receipt lookup failed: {e}"),
                inner_error: e,
            })?;
        if receipt.is_some() {
            return Ok(RetryOutcome::Skipped);
        }

        if current.retry_count >= config.max_retries_per_tx {
            return self.stop_retrying(&current, StopCause::Exhausted).await;
        }

        // A cancelled record is never rebroadcast, so it would sit in the
        // confirmation batch until it is mined
        if current.cancel_requested {
            return self.stop_retrying(&current, StopCause::Cancelled).await;
        }

        let (Some(nonce), Some(last_attempt)) = (current.nonce, current.last_attempt()) else {
            return Err(RelayerError::InternalError {
                message: format!("submitted record {} has no nonce or attempt", current.id),
            });
        };

        let network_fees = ledger
            .estimate_fees()
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    transaction_id = %current.id,
                    error = %e,
                    "Fee estimation failed, escalating from last attempt only"
                );
            })
            .ok();

        let fees = escalate_fees(
            self.fee_policy.as_ref(),
            FeeCaps::from(config),
            &last_attempt.fees,
            network_fees.as_ref(),
        );
        let gas_limit = last_attempt.gas_limit;

        let signed = self
            .sign_transaction(&current, nonce, gas_limit, fees)
            .await?;

        let attempt = TransactionAttempt {
            hash: signed.hash,
            fees,
            gas_limit,
            sent_at: now_millis(),
            block_number,
            attempt_number: current.attempts.len() as u32 + 1,
        };

        // The attempt is on record before it leaves the process
        let expected_retry_count = current.retry_count;
        let recorded = modify_record(self.store.as_ref(), &current.id, |latest| {
            if latest.status != TransactionStatus::Submitted
                || latest.cancel_requested
                || latest.retry_count != expected_retry_count
            {
                return Ok(None);
            }

            let mut next = latest.clone();
            next.retry_count += 1;
            next.transaction_hash = Some(attempt.hash);
            next.attempts.push(attempt.clone());
            next.sent_at_block = Some(block_number);
            next.submitted_at = Some(attempt.sent_at);
            Ok(Some(next))
        })
        .await?;

        let Some(recorded) = recorded else {
            return Ok(RetryOutcome::Skipped);
        };

        match ledger.send_raw_transaction(&signed.raw).await {
            Ok(_) => {}
            Err(e) => match classify_send_error(&e, SendContext::Rebroadcast) {
                SendErrorClassification::PossiblySent => tracing::warn!(
                    transaction_id = %recorded.id,
                    error = %e,
                    "Rebroadcast result ambiguous, assuming sent"
                ),
                _ => tracing::warn!(
                    transaction_id = %recorded.id,
                    error = %e,
                    "Rebroadcast rejected, attempt still counts as a retry"
                ),
            },
        }

        tracing::info!(
            transaction_id = %recorded.id,
            nonce = nonce,
            hash = %attempt.hash,
            retry_count = recorded.retry_count,
            fees = %fees,
            "Transaction rebroadcast"
        );
        Ok(RetryOutcome::Retried)
    }

    async fn stop_retrying(
        &self,
        current: &TransactionRecord,
        cause: StopCause,
    ) -> Result<RetryOutcome, RelayerError> {
        let errored = modify_record(self.store.as_ref(), &current.id, |latest| {
            if latest.status != TransactionStatus::Submitted {
                return Ok(None);
            }

            let mut next = latest.clone();
            next.status = TransactionStatus::Errored;
            next.error_message = Some(match cause {
                StopCause::Exhausted => exhaustion_message(
                    latest.retry_count,
                    latest.last_attempt().map(|attempt| &attempt.fees),
                ),
                StopCause::Cancelled => cancellation_message(latest.retry_count),
            });
            Ok(Some(next))
        })
        .await?;

        Ok(match errored {
            Some(record) => {
                tracing::error!(
                    transaction_id = %record.id,
                    nonce = ?record.nonce,
                    retry_count = record.retry_count,
                    cause = ?cause,
                    "Stopped retrying transaction"
                );
                RetryOutcome::Exhausted
            }
            None => RetryOutcome::Skipped,
        })
    }
}

use std::{collections::BTreeMap, sync::Arc};

use alloy::primitives::Address;
use dashmap::DashMap;
use relayer_core::error::EngineError;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::relay::{
    ledger::Ledger,
    store::{
        NonceState, TransactionRecord, TransactionStatus, TransactionStore, TransactionStoreError,
        WalletKey,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum NonceError {
    #[error("Nonce allocation conflict for {wallet} on chain {chain_id} at nonce {nonce}: {reason}")]
    AllocationConflict {
        chain_id: u64,
        wallet: Address,
        nonce: u64,
        reason: String,
    },

    #[error("Store error: {message}")]
    StoreError {
        message: String,
        inner_error: TransactionStoreError,
    },

    #[error("Ledger error: {message}")]
    LedgerError {
        message: String,
        inner_error: EngineError,
    },
}

impl From<TransactionStoreError> for NonceError {
    fn from(error: TransactionStoreError) -> Self {
        NonceError::StoreError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<EngineError> for NonceError {
    fn from(error: EngineError) -> Self {
        NonceError::LedgerError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

/// Exclusive access to one wallet's nonce domain. Dropping the lease releases it.
pub struct WalletLease {
    wallet: WalletKey,
    _guard: OwnedMutexGuard<()>,
}

impl WalletLease {
    pub fn wallet(&self) -> WalletKey {
        self.wallet
    }
}

/// Nonce bookkeeping after reconciling with the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSnapshot {
    pub ledger_nonce: u64,
    pub next_nonce: u64,
    pub released: Vec<u64>,
}

/// Hands out nonces per (chain, wallet).
///
/// Bookkeeping lives in the store, the mutual exclusion is process-local. All
/// schedulers touching a wallet's nonces go through the same manager.
pub struct NonceManager<S> {
    store: Arc<S>,
    locks: DashMap<WalletKey, Arc<Mutex<()>>>,
}

impl<S: TransactionStore> NonceManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub async fn lease(&self, wallet: WalletKey) -> WalletLease {
        let lock = self
            .locks
            .entry(wallet)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        WalletLease {
            wallet,
            _guard: lock.lock_owned().await,
        }
    }

    /// Brings local bookkeeping in line with the ledger and checks that every
    /// nonce the ledger has not yet passed is accounted for.
    #[tracing::instrument(skip_all, fields(wallet = %lease.wallet))]
    pub async fn reconcile<L: Ledger>(
        &self,
        lease: &WalletLease,
        ledger: &L,
    ) -> Result<NonceSnapshot, NonceError> {
        let wallet = lease.wallet;
        let ledger_nonce = ledger.account_nonce(wallet.wallet).await?;
        let stored = self.store.get_nonce_state(wallet).await?;

        let mut state = stored.clone().unwrap_or_default();
        state.next_nonce = state.next_nonce.max(ledger_nonce);
        state.released.retain(|nonce| *nonce >= ledger_nonce);

        let holders = self
            .store
            .records_with_nonces(wallet, ledger_nonce, u64::MAX)
            .await?;

        // Live records beyond the local counter mean the bookkeeping is stale
        if let Some(highest) = holders
            .iter()
            .filter(|record| holds_nonce(record))
            .filter_map(|record| record.nonce)
            .max()
        {
            if highest >= state.next_nonce {
                tracing::info!(
                    local_next = state.next_nonce,
                    highest_held = highest,
                    "Fast-forwarding local nonce past records that already hold nonces"
                );
                state.next_nonce = highest + 1;
            }
        }

        let mut by_nonce: BTreeMap<u64, Vec<&TransactionRecord>> = BTreeMap::new();
        for record in &holders {
            if let Some(nonce) = record.nonce {
                by_nonce.entry(nonce).or_default().push(record);
            }
        }

        for nonce in ledger_nonce..state.next_nonce {
            if state.released.contains(&nonce) {
                continue;
            }

            let records = by_nonce.get(&nonce).map(Vec::as_slice).unwrap_or_default();
            if records.iter().any(|record| holds_nonce(record)) {
                continue;
            }

            let reason = match records.first() {
                Some(record) => format!(
                    "nonce is held by {} record {} and was never accepted by the network",
                    record.status, record.id
                ),
                None => "no record or released entry accounts for this nonce".to_string(),
            };

            return Err(NonceError::AllocationConflict {
                chain_id: wallet.chain_id,
                wallet: wallet.wallet,
                nonce,
                reason,
            });
        }

        if stored.as_ref() != Some(&state) {
            self.store.set_nonce_state(wallet, &state).await?;
        }

        Ok(NonceSnapshot {
            ledger_nonce,
            next_nonce: state.next_nonce,
            released: state.released.iter().copied().collect(),
        })
    }

    /// Next nonce for the leased wallet, lowest released nonce first
    pub async fn allocate<L: Ledger>(
        &self,
        lease: &WalletLease,
        ledger: &L,
    ) -> Result<u64, NonceError> {
        let wallet = lease.wallet;
        let mut state = match self.store.get_nonce_state(wallet).await? {
            Some(state) => state,
            None => NonceState {
                next_nonce: ledger.account_nonce(wallet.wallet).await?,
                ..Default::default()
            },
        };

        let nonce = match state.released.pop_first() {
            Some(nonce) => nonce,
            None => {
                let nonce = state.next_nonce;
                state.next_nonce += 1;
                nonce
            }
        };

        self.store.set_nonce_state(wallet, &state).await?;
        tracing::debug!(wallet = %wallet, nonce = nonce, "Allocated nonce");
        Ok(nonce)
    }

    /// Returns a nonce the network never accepted
    pub async fn release(&self, lease: &WalletLease, nonce: u64) -> Result<(), NonceError> {
        let wallet = lease.wallet;
        let Some(mut state) = self.store.get_nonce_state(wallet).await? else {
            // Nothing to hand it back to; the next allocation resyncs from the ledger
            return Ok(());
        };

        if nonce + 1 == state.next_nonce {
            state.next_nonce = nonce;
        } else if nonce < state.next_nonce {
            state.released.insert(nonce);
        }

        self.store.set_nonce_state(wallet, &state).await?;
        tracing::debug!(wallet = %wallet, nonce = nonce, "Released nonce");
        Ok(())
    }

    /// Drops local bookkeeping so the next allocation resyncs from the ledger
    pub async fn reset(&self, wallet: WalletKey) -> Result<(), NonceError> {
        let _lease = self.lease(wallet).await;
        self.store.clear_nonce_state(wallet).await?;
        tracing::info!(wallet = %wallet, "Nonce bookkeeping reset");
        Ok(())
    }
}

/// Whether the record keeps its nonce occupied
fn holds_nonce(record: &TransactionRecord) -> bool {
    record.nonce.is_some()
        && matches!(
            record.status,
            TransactionStatus::Queued
                | TransactionStatus::Submitted
                | TransactionStatus::Mined
                | TransactionStatus::Reverted
        )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use alloy::primitives::{B256, Bytes, address};
    use relayer_core::{
        error::EngineError,
        transaction::{FeeValues, TransactionIntent},
    };

    use super::*;
    use crate::relay::{
        ledger::{CallRequest, ReceiptOutcome},
        store::InMemoryTransactionStore,
    };

    const WALLET: Address = address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8");

    fn wallet() -> WalletKey {
        WalletKey {
            chain_id: 1,
            wallet: WALLET,
        }
    }

    /// Only answers account nonce queries
    struct NonceOnlyLedger {
        nonce: AtomicU64,
    }

    impl NonceOnlyLedger {
        fn at(nonce: u64) -> Self {
            Self {
                nonce: AtomicU64::new(nonce),
            }
        }
    }

    fn unsupported() -> EngineError {
        EngineError::InternalError {
            message: "not available in this test".to_string(),
        }
    }

    impl Ledger for NonceOnlyLedger {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn block_number(&self) -> Result<u64, EngineError> {
            Err(unsupported())
        }

        async fn account_nonce(&self, _wallet: Address) -> Result<u64, EngineError> {
            Ok(self.nonce.load(Ordering::SeqCst))
        }

        async fn receipt(&self, _hash: B256) -> Result<Option<ReceiptOutcome>, EngineError> {
            Err(unsupported())
        }

        async fn estimate_fees(&self) -> Result<FeeValues, EngineError> {
            Err(unsupported())
        }

        async fn estimate_gas(&self, _call: &CallRequest) -> Result<u64, EngineError> {
            Err(unsupported())
        }

        async fn send_raw_transaction(&self, _raw: &Bytes) -> Result<B256, EngineError> {
            Err(unsupported())
        }
    }

    async fn insert_with_nonce(
        store: &InMemoryTransactionStore,
        nonce: u64,
        status: TransactionStatus,
    ) -> TransactionRecord {
        let mut record = TransactionRecord::queued(TransactionIntent {
            chain_id: 1,
            wallet_address: WALLET,
            account_address: None,
            contract_address: Some(Address::ZERO),
            data: Bytes::new(),
            value: Default::default(),
            extension: None,
            gas_limit: None,
            fees: None,
        });
        record.nonce = Some(nonce);
        record.status = status;
        store.insert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn allocates_sequentially_from_ledger_nonce() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store);
        let ledger = NonceOnlyLedger::at(7);

        let lease = manager.lease(wallet()).await;
        assert_eq!(manager.allocate(&lease, &ledger).await.unwrap(), 7);
        assert_eq!(manager.allocate(&lease, &ledger).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn released_nonce_is_handed_out_first() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store.clone());
        let ledger = NonceOnlyLedger::at(0);

        let lease = manager.lease(wallet()).await;
        for _ in 0..3 {
            manager.allocate(&lease, &ledger).await.unwrap();
        }
        manager.release(&lease, 1).await.unwrap();

        assert_eq!(manager.allocate(&lease, &ledger).await.unwrap(), 1);
        assert_eq!(manager.allocate(&lease, &ledger).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn releasing_the_top_nonce_rewinds_the_counter() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store.clone());
        let ledger = NonceOnlyLedger::at(4);

        let lease = manager.lease(wallet()).await;
        let nonce = manager.allocate(&lease, &ledger).await.unwrap();
        manager.release(&lease, nonce).await.unwrap();

        let state = store.get_nonce_state(wallet()).await.unwrap().unwrap();
        assert_eq!(state.next_nonce, 4);
        assert!(state.released.is_empty());
    }

    #[tokio::test]
    async fn reconcile_fast_forwards_to_ledger() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store.clone());
        store
            .set_nonce_state(
                wallet(),
                &NonceState {
                    next_nonce: 2,
                    released: [0, 1].into(),
                },
            )
            .await
            .unwrap();

        let lease = manager.lease(wallet()).await;
        let snapshot = manager
            .reconcile(&lease, &NonceOnlyLedger::at(5))
            .await
            .unwrap();

        assert_eq!(snapshot.next_nonce, 5);
        assert!(snapshot.released.is_empty());
    }

    #[tokio::test]
    async fn reconcile_skips_past_nonces_held_by_live_records() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store.clone());
        insert_with_nonce(&store, 3, TransactionStatus::Submitted).await;
        insert_with_nonce(&store, 4, TransactionStatus::Submitted).await;

        let lease = manager.lease(wallet()).await;
        let snapshot = manager
            .reconcile(&lease, &NonceOnlyLedger::at(3))
            .await
            .unwrap();

        assert_eq!(snapshot.next_nonce, 5);
        assert_eq!(
            manager.allocate(&lease, &NonceOnlyLedger::at(3)).await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn untracked_gap_is_a_conflict() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store.clone());
        insert_with_nonce(&store, 2, TransactionStatus::Submitted).await;
        store
            .set_nonce_state(
                wallet(),
                &NonceState {
                    next_nonce: 3,
                    released: Default::default(),
                },
            )
            .await
            .unwrap();

        let lease = manager.lease(wallet()).await;
        let error = manager
            .reconcile(&lease, &NonceOnlyLedger::at(0))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            NonceError::AllocationConflict { nonce: 0, .. }
        ));
    }

    #[tokio::test]
    async fn errored_record_blocking_the_ledger_is_a_conflict() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store.clone());
        let stuck = insert_with_nonce(&store, 0, TransactionStatus::Errored).await;
        insert_with_nonce(&store, 1, TransactionStatus::Submitted).await;

        let lease = manager.lease(wallet()).await;
        let error = manager
            .reconcile(&lease, &NonceOnlyLedger::at(0))
            .await
            .unwrap_err();

        match error {
            NonceError::AllocationConflict { nonce, reason, .. } => {
                assert_eq!(nonce, 0);
                assert!(reason.contains(&stuck.id));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_forces_resync_from_ledger() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = NonceManager::new(store.clone());

        {
            let lease = manager.lease(wallet()).await;
            manager
                .allocate(&lease, &NonceOnlyLedger::at(10))
                .await
                .unwrap();
        }

        manager.reset(wallet()).await.unwrap();
        assert!(store.get_nonce_state(wallet()).await.unwrap().is_none());

        let lease = manager.lease(wallet()).await;
        assert_eq!(
            manager.allocate(&lease, &NonceOnlyLedger::at(20)).await.unwrap(),
            20
        );
    }

    #[tokio::test]
    async fn leases_serialize_same_wallet() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let manager = Arc::new(NonceManager::new(store));
        let ledger = Arc::new(NonceOnlyLedger::at(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let lease = manager.lease(wallet()).await;
                manager.allocate(&lease, ledger.as_ref()).await.unwrap()
            }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..16).collect::<Vec<_>>());
    }
}

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use super::{
    BorrowedTransaction, NonceState, TransactionPage, TransactionQuery, TransactionRecord,
    TransactionStatus, TransactionStore, TransactionStoreError, WalletKey, check_update,
};

#[derive(Default)]
struct Inner {
    records: HashMap<String, (u64, TransactionRecord)>,
    sequence: u64,
    nonce_states: HashMap<WalletKey, NonceState>,
    borrowed: HashMap<String, BorrowedTransaction>,
    leases: HashMap<String, (String, Instant)>,
}

impl Inner {
    /// Records in insertion order
    fn ordered(&self) -> Vec<&TransactionRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|(seq, record)| (record.created_at, *seq));
        records.into_iter().map(|(_, record)| record).collect()
    }
}

/// Process-local store with the same semantics as [`super::RedisTransactionStore`]
#[derive(Default)]
pub struct InMemoryTransactionStore {
    inner: Mutex<Inner>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.records.contains_key(&record.id) {
            return Err(TransactionStoreError::AlreadyExists {
                transaction_id: record.id.clone(),
            });
        }

        inner.sequence += 1;
        let seq = inner.sequence;
        inner.records.insert(record.id.clone(), (seq, record.clone()));
        Ok(())
    }

    async fn get(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(transaction_id)
            .map(|(_, record)| record.clone()))
    }

    async fn update(
        &self,
        current: &TransactionRecord,
        next: &TransactionRecord,
    ) -> Result<TransactionRecord, TransactionStoreError> {
        check_update(current, next)?;

        let mut inner = self.inner.lock().await;
        let (_, stored) = inner.records.get_mut(&current.id).ok_or_else(|| {
            TransactionStoreError::TransactionNotFound {
                transaction_id: current.id.clone(),
            }
        })?;

        if stored.revision != current.revision {
            return Err(TransactionStoreError::RevisionConflict {
                transaction_id: current.id.clone(),
                expected: current.revision,
            });
        }

        let mut next = next.clone();
        next.revision = current.revision + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ordered()
            .into_iter()
            .filter(|record| record.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(
        &self,
        status: TransactionStatus,
    ) -> Result<u64, TransactionStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|(_, record)| record.status == status)
            .count() as u64)
    }

    async fn query(
        &self,
        query: &TransactionQuery,
    ) -> Result<TransactionPage, TransactionStoreError> {
        let inner = self.inner.lock().await;
        let matching: Vec<_> = inner
            .ordered()
            .into_iter()
            .filter(|record| query.matches(record))
            .collect();

        Ok(TransactionPage {
            total_count: matching.len() as u64,
            transactions: matching
                .into_iter()
                .skip(query.offset())
                .take(query.limit() as usize)
                .cloned()
                .collect(),
            page: query.page(),
            limit: query.limit(),
        })
    }

    async fn records_with_nonces(
        &self,
        wallet: WalletKey,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransactionRecord>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner
            .records
            .values()
            .map(|(_, record)| record)
            .filter(|record| {
                record.wallet_key() == wallet
                    && record.nonce.is_some_and(|nonce| nonce >= from && nonce < to)
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.nonce);
        Ok(records)
    }

    async fn get_nonce_state(
        &self,
        wallet: WalletKey,
    ) -> Result<Option<NonceState>, TransactionStoreError> {
        Ok(self.inner.lock().await.nonce_states.get(&wallet).cloned())
    }

    async fn set_nonce_state(
        &self,
        wallet: WalletKey,
        state: &NonceState,
    ) -> Result<(), TransactionStoreError> {
        self.inner
            .lock()
            .await
            .nonce_states
            .insert(wallet, state.clone());
        Ok(())
    }

    async fn clear_nonce_state(&self, wallet: WalletKey) -> Result<(), TransactionStoreError> {
        self.inner.lock().await.nonce_states.remove(&wallet);
        Ok(())
    }

    async fn put_borrowed(
        &self,
        borrowed: &BorrowedTransaction,
    ) -> Result<(), TransactionStoreError> {
        self.inner
            .lock()
            .await
            .borrowed
            .insert(borrowed.transaction_id.clone(), borrowed.clone());
        Ok(())
    }

    async fn remove_borrowed(&self, transaction_id: &str) -> Result<(), TransactionStoreError> {
        self.inner.lock().await.borrowed.remove(transaction_id);
        Ok(())
    }

    async fn list_borrowed(&self) -> Result<Vec<BorrowedTransaction>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        let mut borrowed: Vec<_> = inner.borrowed.values().cloned().collect();
        borrowed.sort_by_key(|entry| (entry.wallet_key(), entry.nonce));
        Ok(borrowed)
    }

    async fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        match inner.leases.get(name) {
            Some((holder, expires_at)) if holder != owner && *expires_at > now => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(name.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .leases
            .get(name)
            .is_some_and(|(holder, _)| holder == owner)
        {
            inner.leases.remove(name);
        }
        Ok(())
    }
}

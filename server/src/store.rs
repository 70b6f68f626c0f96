use std::time::Duration;

use relayer_executors::relay::{
    InMemoryTransactionStore, RedisTransactionStore, TransactionStatus, TransactionStore,
    TransactionStoreError, WalletKey,
    store::{BorrowedTransaction, NonceState, TransactionPage, TransactionQuery, TransactionRecord},
};

/// Store backend chosen by `relayer.store`
pub enum RelayStore {
    Redis(RedisTransactionStore),
    Memory(InMemoryTransactionStore),
}

impl RelayStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            RelayStore::Redis(_) => "redis",
            RelayStore::Memory(_) => "memory",
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            RelayStore::Redis($store) => $call.await,
            RelayStore::Memory($store) => $call.await,
        }
    };
}

impl TransactionStore for RelayStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), TransactionStoreError> {
        dispatch!(self, store => store.insert(record))
    }

    async fn get(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, TransactionStoreError> {
        dispatch!(self, store => store.get(transaction_id))
    }

    async fn update(
        &self,
        current: &TransactionRecord,
        next: &TransactionRecord,
    ) -> Result<TransactionRecord, TransactionStoreError> {
        dispatch!(self, store => store.update(current, next))
    }

    async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, TransactionStoreError> {
        dispatch!(self, store => store.list_by_status(status, limit))
    }

    async fn count_by_status(
        &self,
        status: TransactionStatus,
    ) -> Result<u64, TransactionStoreError> {
        dispatch!(self, store => store.count_by_status(status))
    }

    async fn query(
        &self,
        query: &TransactionQuery,
    ) -> Result<TransactionPage, TransactionStoreError> {
        dispatch!(self, store => store.query(query))
    }

    async fn records_with_nonces(
        &self,
        wallet: WalletKey,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransactionRecord>, TransactionStoreError> {
        dispatch!(self, store => store.records_with_nonces(wallet, from, to))
    }

    async fn get_nonce_state(
        &self,
        wallet: WalletKey,
    ) -> Result<Option<NonceState>, TransactionStoreError> {
        dispatch!(self, store => store.get_nonce_state(wallet))
    }

    async fn set_nonce_state(
        &self,
        wallet: WalletKey,
        state: &NonceState,
    ) -> Result<(), TransactionStoreError> {
        dispatch!(self, store => store.set_nonce_state(wallet, state))
    }

    async fn clear_nonce_state(&self, wallet: WalletKey) -> Result<(), TransactionStoreError> {
        dispatch!(self, store => store.clear_nonce_state(wallet))
    }

    async fn put_borrowed(
        &self,
        borrowed: &BorrowedTransaction,
    ) -> Result<(), TransactionStoreError> {
        dispatch!(self, store => store.put_borrowed(borrowed))
    }

    async fn remove_borrowed(&self, transaction_id: &str) -> Result<(), TransactionStoreError> {
        dispatch!(self, store => store.remove_borrowed(transaction_id))
    }

    async fn list_borrowed(&self) -> Result<Vec<BorrowedTransaction>, TransactionStoreError> {
        dispatch!(self, store => store.list_borrowed())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, TransactionStoreError> {
        dispatch!(self, store => store.acquire_lease(name, owner, ttl))
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<(), TransactionStoreError> {
        dispatch!(self, store => store.release_lease(name, owner))
    }
}

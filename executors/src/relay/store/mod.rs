use std::{collections::BTreeSet, future::Future, time::Duration};

use alloy::primitives::{Address, B256, Bytes, U256};
use relayer_core::{
    defs::{AddressDef, BytesDef, HashDef, U256Def},
    transaction::{FeeValues, TransactionIntent, TransactionTypeData},
};
use serde::{Deserialize, Serialize};

mod error;
mod memory;
mod redis_store;

pub use error::TransactionStoreError;
pub use memory::InMemoryTransactionStore;
pub use redis_store::{RedisTransactionStore, StoreKeys};

/// Attempts made by [`modify_record`] before giving up on a contended record
const MAX_MODIFY_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Queued,
    Submitted,
    Mined,
    Reverted,
    Errored,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 6] = [
        TransactionStatus::Queued,
        TransactionStatus::Submitted,
        TransactionStatus::Mined,
        TransactionStatus::Reverted,
        TransactionStatus::Errored,
        TransactionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Queued => "queued",
            TransactionStatus::Submitted => "submitted",
            TransactionStatus::Mined => "mined",
            TransactionStatus::Reverted => "reverted",
            TransactionStatus::Errored => "errored",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Mined
                | TransactionStatus::Reverted
                | TransactionStatus::Errored
                | TransactionStatus::Cancelled
        )
    }

    /// Lifecycle table. Staying in `queued` or `submitted` is allowed so
    /// bookkeeping fields can change without a status move.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;

        matches!(
            (self, next),
            (Queued, Queued)
                | (Queued, Submitted)
                | (Queued, Cancelled)
                | (Queued, Errored)
                | (Submitted, Submitted)
                | (Submitted, Mined)
                | (Submitted, Reverted)
                | (Submitted, Errored)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown transaction status '{s}'"))
    }
}

/// One broadcast of a transaction. Every retry adds an attempt with the same
/// nonce and new fee values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAttempt {
    #[schema(value_type = HashDef)]
    pub hash: B256,
    pub fees: FeeValues,
    pub gas_limit: u64,
    /// Unix timestamp in milliseconds
    pub sent_at: u64,
    /// Chain height observed right before the broadcast
    pub block_number: u64,
    pub attempt_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub chain_id: u64,
    #[schema(value_type = AddressDef)]
    pub wallet_address: Address,
    #[schema(value_type = Option<AddressDef>)]
    pub account_address: Option<Address>,
    #[schema(value_type = Option<AddressDef>)]
    pub contract_address: Option<Address>,
    #[schema(value_type = BytesDef)]
    pub data: Bytes,
    #[schema(value_type = U256Def)]
    pub value: U256,
    pub extension: Option<String>,

    pub status: TransactionStatus,
    /// Assigned once at submission, `None` while queued
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    /// Fee overrides given at intake
    pub fees: Option<TransactionTypeData>,

    /// Hash of the latest broadcast
    #[schema(value_type = Option<HashDef>)]
    pub transaction_hash: Option<B256>,
    pub attempts: Vec<TransactionAttempt>,
    pub retry_count: u32,
    pub cancel_requested: bool,

    /// Unix timestamps in milliseconds
    pub created_at: u64,
    pub submitted_at: Option<u64>,
    pub mined_at: Option<u64>,

    /// Chain height at the latest broadcast, drives retry age
    pub sent_at_block: Option<u64>,
    pub mined_block: Option<u64>,
    pub gas_used: Option<u64>,
    #[schema(value_type = Option<AddressDef>)]
    pub deployed_contract_address: Option<Address>,
    pub error_message: Option<String>,

    /// Bumped on every store write, used for compare-and-set updates
    pub revision: u64,
}

impl TransactionRecord {
    pub fn queued(intent: TransactionIntent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chain_id: intent.chain_id,
            wallet_address: intent.wallet_address,
            account_address: intent.account_address,
            contract_address: intent.contract_address,
            data: intent.data,
            value: intent.value,
            extension: intent.extension,
            status: TransactionStatus::Queued,
            nonce: None,
            gas_limit: intent.gas_limit,
            fees: intent.fees,
            transaction_hash: None,
            attempts: Vec::new(),
            retry_count: 0,
            cancel_requested: false,
            created_at: now_millis(),
            submitted_at: None,
            mined_at: None,
            sent_at_block: None,
            mined_block: None,
            gas_used: None,
            deployed_contract_address: None,
            error_message: None,
            revision: 0,
        }
    }

    pub fn wallet_key(&self) -> WalletKey {
        WalletKey {
            chain_id: self.chain_id,
            wallet: self.wallet_address,
        }
    }

    pub fn is_deployment(&self) -> bool {
        self.contract_address.is_none()
    }

    pub fn last_attempt(&self) -> Option<&TransactionAttempt> {
        self.attempts.last()
    }
}

/// Identifies a nonce domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletKey {
    pub chain_id: u64,
    pub wallet: Address,
}

impl std::fmt::Display for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.wallet)
    }
}

/// Local nonce bookkeeping for one wallet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceState {
    /// Next never-used nonce
    pub next_nonce: u64,
    /// Nonces handed out but never accepted by the network. Reused first.
    pub released: BTreeSet<u64>,
}

/// A signed payload parked in the store between signing and the status
/// update that follows its broadcast. Leftovers indicate a crash in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowedTransaction {
    pub transaction_id: String,
    pub chain_id: u64,
    pub wallet_address: Address,
    pub nonce: u64,
    pub raw: Bytes,
    pub hash: B256,
    pub fees: FeeValues,
    pub gas_limit: u64,
    pub block_number: u64,
    pub borrowed_at: u64,
}

impl BorrowedTransaction {
    pub fn wallet_key(&self) -> WalletKey {
        WalletKey {
            chain_id: self.chain_id,
            wallet: self.wallet_address,
        }
    }

    pub fn attempt(&self, attempt_number: u32) -> TransactionAttempt {
        TransactionAttempt {
            hash: self.hash,
            fees: self.fees,
            gas_limit: self.gas_limit,
            sent_at: now_millis(),
            block_number: self.block_number,
            attempt_number,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct TransactionQuery {
    pub status: Option<TransactionStatus>,
    pub extension: Option<String>,
    pub chain_id: Option<u64>,
    /// Only records created at or after this unix timestamp in milliseconds
    pub from_time: Option<u64>,
    /// Only records created at or before this unix timestamp in milliseconds
    pub to_time: Option<u64>,
    /// Only deployments whose contract address is known
    #[serde(default)]
    pub deployed_only: bool,
    /// 1-based page number
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 500;

impl TransactionQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn offset(&self) -> usize {
        ((self.page() - 1) * self.limit()) as usize
    }

    /// Whether a record satisfies every filter of the query
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.status.is_none_or(|status| record.status == status)
            && self
                .extension
                .as_ref()
                .is_none_or(|ext| record.extension.as_deref() == Some(ext.as_str()))
            && self.chain_id.is_none_or(|chain| record.chain_id == chain)
            && self.from_time.is_none_or(|from| record.created_at >= from)
            && self.to_time.is_none_or(|to| record.created_at <= to)
            && (!self.deployed_only || record.deployed_contract_address.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub transactions: Vec<TransactionRecord>,
    pub page: u32,
    pub limit: u32,
    pub total_count: u64,
}

/// Durable source of truth for transaction records and the bookkeeping the
/// relay loops need around them.
pub trait TransactionStore: Send + Sync + 'static {
    fn insert(
        &self,
        record: &TransactionRecord,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn get(
        &self,
        transaction_id: &str,
    ) -> impl Future<Output = Result<Option<TransactionRecord>, TransactionStoreError>> + Send;

    /// Writes `next` if the stored record is still at `current.revision` and
    /// the status move is allowed. Returns the stored record.
    fn update(
        &self,
        current: &TransactionRecord,
        next: &TransactionRecord,
    ) -> impl Future<Output = Result<TransactionRecord, TransactionStoreError>> + Send;

    /// Oldest first, by creation time
    fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TransactionRecord>, TransactionStoreError>> + Send;

    fn count_by_status(
        &self,
        status: TransactionStatus,
    ) -> impl Future<Output = Result<u64, TransactionStoreError>> + Send;

    fn query(
        &self,
        query: &TransactionQuery,
    ) -> impl Future<Output = Result<TransactionPage, TransactionStoreError>> + Send;

    /// Records of `wallet` holding a nonce in `from..to`
    fn records_with_nonces(
        &self,
        wallet: WalletKey,
        from: u64,
        to: u64,
    ) -> impl Future<Output = Result<Vec<TransactionRecord>, TransactionStoreError>> + Send;

    fn get_nonce_state(
        &self,
        wallet: WalletKey,
    ) -> impl Future<Output = Result<Option<NonceState>, TransactionStoreError>> + Send;

    fn set_nonce_state(
        &self,
        wallet: WalletKey,
        state: &NonceState,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn clear_nonce_state(
        &self,
        wallet: WalletKey,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn put_borrowed(
        &self,
        borrowed: &BorrowedTransaction,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn remove_borrowed(
        &self,
        transaction_id: &str,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn list_borrowed(
        &self,
    ) -> impl Future<Output = Result<Vec<BorrowedTransaction>, TransactionStoreError>> + Send;

    /// Takes the named lease, or extends it when `owner` already holds it
    fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, TransactionStoreError>> + Send;

    fn release_lease(
        &self,
        name: &str,
        owner: &str,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;
}

/// Read-modify-write of one record, retried on revision conflicts.
///
/// `f` returns `Ok(None)` when no write is needed for the current state.
pub async fn modify_record<S, F>(
    store: &S,
    transaction_id: &str,
    mut f: F,
) -> Result<Option<TransactionRecord>, TransactionStoreError>
where
    S: TransactionStore,
    F: FnMut(&TransactionRecord) -> Result<Option<TransactionRecord>, TransactionStoreError>
        + Send,
{
    for attempt in 0..MAX_MODIFY_ATTEMPTS {
        let current = store.get(transaction_id).await?.ok_or_else(|| {
            TransactionStoreError::TransactionNotFound {
                transaction_id: transaction_id.to_string(),
            }
        })?;

        let Some(next) = f(&current)? else {
            return Ok(None);
        };

        match store.update(&current, &next).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(TransactionStoreError::RevisionConflict { .. }) => {
                tracing::debug!(
                    transaction_id = transaction_id,
                    attempt = attempt,
                    "Record changed concurrently, retrying update"
                );
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(TransactionStoreError::Contended {
        transaction_id: transaction_id.to_string(),
        attempts: MAX_MODIFY_ATTEMPTS,
    })
}

/// Checks the parts of an update every backend enforces the same way
pub(crate) fn check_update(
    current: &TransactionRecord,
    next: &TransactionRecord,
) -> Result<(), TransactionStoreError> {
    if current.id != next.id {
        return Err(TransactionStoreError::InternalError {
            message: format!("cannot replace record {} with {}", current.id, next.id),
        });
    }

    if !current.status.can_transition_to(next.status) {
        return Err(TransactionStoreError::IllegalTransition {
            transaction_id: current.id.clone(),
            from: current.status,
            to: next.status,
        });
    }

    if current.status == TransactionStatus::Submitted && current.nonce != next.nonce {
        return Err(TransactionStoreError::InternalError {
            message: format!("nonce of submitted record {} cannot change", current.id),
        });
    }

    Ok(())
}

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionStatus::*;

    #[test]
    fn terminal_states_never_move() {
        for from in [Mined, Reverted, Errored, Cancelled] {
            for to in TransactionStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn cancellation_only_from_queued() {
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Submitted.can_transition_to(Cancelled));
    }

    #[test]
    fn submitted_cannot_go_back_to_queued() {
        assert!(!Submitted.can_transition_to(Queued));
        assert!(Submitted.can_transition_to(Submitted));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in TransactionStatus::ALL {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        assert!("pending".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn query_paging_is_clamped() {
        let query = TransactionQuery {
            page: Some(0),
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.limit(), MAX_PAGE_LIMIT);
        assert_eq!(query.offset(), 0);

        let query = TransactionQuery {
            page: Some(3),
            limit: Some(20),
            ..Default::default()
        };
        assert_eq!(query.offset(), 40);
    }
}

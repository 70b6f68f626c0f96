pub mod fees;
pub mod ledger;
pub mod nonce_manager;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use fees::{FeeCaps, FeeEscalationPolicy, PercentageBump};
pub use ledger::{CallRequest, Ledger, LedgerService, ReceiptOutcome, RpcLedger};
pub use nonce_manager::{NonceError, NonceManager, NonceSnapshot, WalletLease};
pub use scheduler::{Cadence, TaskRunner};
pub use store::{
    InMemoryTransactionStore, RedisTransactionStore, TransactionRecord, TransactionStatus,
    TransactionStore, TransactionStoreError, WalletKey,
};
pub use worker::{
    ConfirmationReport, RelayWorker, RetryReport, SubmissionReport, error::RelayerError,
};

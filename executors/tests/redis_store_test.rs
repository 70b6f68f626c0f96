
use std::time::Duration;

use fixtures::*;
use redis::{AsyncCommands, aio::ConnectionManager};
use relayer_executors::relay::{
    RedisTransactionStore, TransactionStatus, TransactionStore, TransactionStoreError,
    store::{BorrowedTransaction, NonceState, TransactionQuery, TransactionRecord, now_millis},
};

const REDIS_URL: &str = "redis://127.0.0.1:6379/";

async fn store() -> (RedisTransactionStore, String) {
    setup_tracing();

    let namespace = format!("test_{}", uuid::Uuid::new_v4().simple());
    let client = redis::Client::open(REDIS_URL).unwrap();
    let redis = ConnectionManager::new(client).await.unwrap();
    (RedisTransactionStore::new(redis, Some(namespace.clone())), namespace)
}

async fn cleanup(store: &RedisTransactionStore, namespace: &str) {
    let mut conn = store.redis.clone();
    let keys: Vec<String> = conn.keys(format!("{namespace}:*")).await.unwrap();
    if !keys.is_empty() {
        let _: () = conn.del(keys).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "needs a redis server at 127.0.0.1:6379"]
async fn status_indexes_follow_updates() {
    let (store, namespace) = store().await;

    let first = TransactionRecord::queued(intent(WALLET_A));
    let second = TransactionRecord::queued(intent(WALLET_A));
    store.insert(&first).await.unwrap();
    store.insert(&second).await.unwrap();

    let queued = store
        .list_by_status(TransactionStatus::Queued, usize::MAX)
        .await
        .unwrap();
    assert_eq!(
        queued.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec![first.id.as_str(), second.id.as_str()]
    );

    let mut submitted = first.clone();
    submitted.status = TransactionStatus::Submitted;
    submitted.nonce = Some(0);
    let stored = store.update(&first, &submitted).await.unwrap();
    assert_eq!(stored.revision, first.revision + 1);

    assert_eq!(
        store.count_by_status(TransactionStatus::Queued).await.unwrap(),
        1
    );
    assert_eq!(
        store.count_by_status(TransactionStatus::Submitted).await.unwrap(),
        1
    );

    let holders = store
        .records_with_nonces(first.wallet_key(), 0, 10)
        .await
        .unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].id, first.id);

    cleanup(&store, &namespace).await;
}

#[tokio::test]
#[ignore = "needs a redis server at 127.0.0.1:6379"]
async fn stale_revisions_and_illegal_moves_are_rejected() {
    let (store, namespace) = store().await;

    let record = TransactionRecord::queued(intent(WALLET_A));
    store.insert(&record).await.unwrap();

    let mut cancelled = record.clone();
    cancelled.status = TransactionStatus::Cancelled;
    let stored = store.update(&record, &cancelled).await.unwrap();

    let stale = store.update(&record, &cancelled).await;
    assert!(matches!(
        stale,
        Err(TransactionStoreError::RevisionConflict { .. })
    ));

    let mut revived = stored.clone();
    revived.status = TransactionStatus::Queued;
    let illegal = store.update(&stored, &revived).await;
    assert!(matches!(
        illegal,
        Err(TransactionStoreError::IllegalTransition { .. })
    ));

    cleanup(&store, &namespace).await;
}

#[tokio::test]
#[ignore = "needs a redis server at 127.0.0.1:6379"]
async fn query_filters_and_pages() {
    let (store, namespace) = store().await;

    for i in 0..5 {
        let mut record = TransactionRecord::queued(intent(WALLET_A));
        if i % 2 == 0 {
            record.extension = Some("mint".to_string());
        }
        store.insert(&record).await.unwrap();
    }

    let page = store
        .query(&TransactionQuery {
            extension: Some("mint".to_string()),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(page.transactions.len(), 2);

    let page = store
        .query(&TransactionQuery {
            extension: Some("mint".to_string()),
            limit: Some(2),
            page: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.transactions.len(), 1);

    cleanup(&store, &namespace).await;
}

#[tokio::test]
#[ignore = "needs a redis server at 127.0.0.1:6379"]
async fn query_intersects_indexes_within_time_range() {
    let (store, namespace) = store().await;

    let mut records = Vec::new();
    for created_at in [1_000, 2_000, 3_000, 4_000] {
        let mut record = TransactionRecord::queued(intent(WALLET_A));
        record.created_at = created_at;
        store.insert(&record).await.unwrap();
        records.push(record);
    }

    let mut submitted = records[1].clone();
    submitted.status = TransactionStatus::Submitted;
    submitted.nonce = Some(0);
    let submitted = store.update(&records[1], &submitted).await.unwrap();
    let mut mined = submitted.clone();
    mined.status = TransactionStatus::Mined;
    mined.deployed_contract_address = Some(TARGET);
    store.update(&submitted, &mined).await.unwrap();

    let page = store
        .query(&TransactionQuery {
            status: Some(TransactionStatus::Queued),
            chain_id: Some(CHAIN_ID),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(
        page.transactions.iter().map(|r| r.created_at).collect::<Vec<_>>(),
        vec![1_000, 3_000, 4_000]
    );

    let page = store
        .query(&TransactionQuery {
            status: Some(TransactionStatus::Mined),
            deployed_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.transactions[0].id, records[1].id);

    let page = store
        .query(&TransactionQuery {
            from_time: Some(2_000),
            to_time: Some(3_000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 2);

    let page = store
        .query(&TransactionQuery {
            status: Some(TransactionStatus::Queued),
            from_time: Some(2_500),
            limit: Some(1),
            page: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 2);
    assert_eq!(page.transactions.len(), 1);
    assert_eq!(page.transactions[0].created_at, 4_000);

    let page = store
        .query(&TransactionQuery {
            chain_id: Some(CHAIN_ID + 1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 0);
    assert!(page.transactions.is_empty());

    let mut conn = store.redis.clone();
    let scratch: Vec<String> = conn
        .keys(format!("{namespace}:relayer:query:*"))
        .await
        .unwrap();
    assert!(scratch.is_empty());

    cleanup(&store, &namespace).await;
}

#[tokio::test]
#[ignore = "needs a redis server at 127.0.0.1:6379"]
async fn nonce_state_borrowed_and_leases() {
    let (store, namespace) = store().await;
    let record = TransactionRecord::queued(intent(WALLET_A));
    let wallet = record.wallet_key();

    assert!(store.get_nonce_state(wallet).await.unwrap().is_none());
    let state = NonceState {
        next_nonce: 4,
        released: [1, 2].into(),
    };
    store.set_nonce_state(wallet, &state).await.unwrap();
    assert_eq!(store.get_nonce_state(wallet).await.unwrap(), Some(state));
    store.clear_nonce_state(wallet).await.unwrap();
    assert!(store.get_nonce_state(wallet).await.unwrap().is_none());

    let borrowed = BorrowedTransaction {
        transaction_id: record.id.clone(),
        chain_id: CHAIN_ID,
        wallet_address: WALLET_A,
        nonce: 3,
        raw: Default::default(),
        hash: Default::default(),
        fees: relayer_core::transaction::FeeValues::Legacy { gas_price: 1 },
        gas_limit: 21_000,
        block_number: 1,
        borrowed_at: now_millis(),
    };
    store.put_borrowed(&borrowed).await.unwrap();
    assert_eq!(store.list_borrowed().await.unwrap(), vec![borrowed]);
    store.remove_borrowed(&record.id).await.unwrap();
    assert!(store.list_borrowed().await.unwrap().is_empty());

    let ttl = Duration::from_secs(30);
    assert!(store.acquire_lease("worker", "a", ttl).await.unwrap());
    assert!(store.acquire_lease("worker", "a", ttl).await.unwrap());
    assert!(!store.acquire_lease("worker", "b", ttl).await.unwrap());
    store.release_lease("worker", "b").await.unwrap();
    assert!(!store.acquire_lease("worker", "b", ttl).await.unwrap());
    store.release_lease("worker", "a").await.unwrap();
    assert!(store.acquire_lease("worker", "b", ttl).await.unwrap());

    cleanup(&store, &namespace).await;
}

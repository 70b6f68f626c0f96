use std::time::Duration;

use redis::{AsyncCommands, aio::ConnectionManager};

use super::{
    BorrowedTransaction, NonceState, TransactionPage, TransactionQuery, TransactionRecord,
    TransactionStatus, TransactionStore, TransactionStoreError, WalletKey, check_update,
};

/// Key naming for everything the relayer keeps in Redis
#[derive(Debug, Clone)]
pub struct StoreKeys {
    pub namespace: Option<String>,
}

impl StoreKeys {
    pub fn new(namespace: Option<String>) -> Self {
        Self { namespace }
    }

    fn prefixed(&self, suffix: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relayer:{suffix}"),
            None => format!("relayer:{suffix}"),
        }
    }

    /// Transaction data is stored as a Redis HSET with the following fields:
    /// - "data": JSON string containing the TransactionRecord
    /// - "status": status string, mirrored from the record for the scripts
    /// - "revision": revision counter, mirrored from the record
    /// - "seq": insertion sequence, the score in the status indexes
    pub fn transaction_key_name(&self, transaction_id: &str) -> String {
        self.prefixed(&format!("tx:{transaction_id}"))
    }

    /// Sorted set of transaction ids per status, scored by insertion sequence
    pub fn status_zset_name(&self, status: TransactionStatus) -> String {
        self.prefixed(&format!("status:{status}"))
    }

    /// Sorted set of every transaction id, scored by creation time in milliseconds
    pub fn created_zset_name(&self) -> String {
        self.prefixed("created")
    }

    /// Creation-time index of one status, kept next to the sequence ordered one
    pub fn created_status_zset_name(&self, status: TransactionStatus) -> String {
        self.prefixed(&format!("created:status:{status}"))
    }

    pub fn created_chain_zset_name(&self, chain_id: u64) -> String {
        self.prefixed(&format!("created:chain:{chain_id}"))
    }

    pub fn created_extension_zset_name(&self, extension: &str) -> String {
        self.prefixed(&format!("created:extension:{extension}"))
    }

    /// Creation-time index of deployments whose contract address is known
    pub fn deployed_zset_name(&self) -> String {
        self.prefixed("created:deployed")
    }

    /// Short-lived intersection of indexes for one query
    pub fn query_scratch_key_name(&self, query_id: &str) -> String {
        self.prefixed(&format!("query:{query_id}"))
    }

    /// Monotonic counter backing the insertion sequence
    pub fn sequence_key_name(&self) -> String {
        self.prefixed("seq")
    }

    /// Sorted set of transaction ids of one wallet, scored by nonce
    pub fn wallet_nonces_zset_name(&self, wallet: WalletKey) -> String {
        self.prefixed(&format!("nonces:{}:{}", wallet.chain_id, wallet.wallet))
    }

    /// JSON encoded NonceState of one wallet
    pub fn nonce_state_key_name(&self, wallet: WalletKey) -> String {
        self.prefixed(&format!("nonce_state:{}:{}", wallet.chain_id, wallet.wallet))
    }

    /// Hash of `transaction_id` -> BorrowedTransaction JSON, used for crash recovery
    pub fn borrowed_hashmap_name(&self) -> String {
        self.prefixed("borrowed")
    }

    pub fn lease_key_name(&self, name: &str) -> String {
        self.prefixed(&format!("lease:{name}"))
    }
}

pub struct RedisTransactionStore {
    pub redis: ConnectionManager,
    pub keys: StoreKeys,
}

impl RedisTransactionStore {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self {
            redis,
            keys: StoreKeys::new(namespace),
        }
    }

    async fn load_many(
        &self,
        ids: &[String],
    ) -> Result<Vec<TransactionRecord>, TransactionStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let mut pipeline = redis::pipe();
        for id in ids {
            pipeline.hget(self.keys.transaction_key_name(id), "data");
        }

        let raw: Vec<Option<String>> = pipeline.query_async(&mut conn).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(TransactionStoreError::from))
            .collect()
    }
}

impl TransactionStore for RedisTransactionStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), TransactionStoreError> {
        let script = redis::Script::new(
            r#"
            local tx_key = KEYS[1]
            local status_zset = KEYS[2]
            local created_zset = KEYS[3]
            local seq_key = KEYS[4]
            local created_status_zset = KEYS[5]
            local created_chain_zset = KEYS[6]
            local created_extension_zset = KEYS[7]

            local id = ARGV[1]
            local data = ARGV[2]
            local status = ARGV[3]
            local revision = ARGV[4]
            local created_at = ARGV[5]
            local has_extension = ARGV[6]

            if redis.call('EXISTS', tx_key) == 1 then
                return 0
            end

            local seq = redis.call('INCR', seq_key)
            redis.call('HSET', tx_key, 'data', data, 'status', status, 'revision', revision, 'seq', seq)
            redis.call('ZADD', status_zset, seq, id)
            redis.call('ZADD', created_zset, created_at, id)
            redis.call('ZADD', created_status_zset, created_at, id)
            redis.call('ZADD', created_chain_zset, created_at, id)
            if has_extension == '1' then
                redis.call('ZADD', created_extension_zset, created_at, id)
            end
            return 1
            "#,
        );

        let inserted: i32 = script
            .key(self.keys.transaction_key_name(&record.id))
            .key(self.keys.status_zset_name(record.status))
            .key(self.keys.created_zset_name())
            .key(self.keys.sequence_key_name())
            .key(self.keys.created_status_zset_name(record.status))
            .key(self.keys.created_chain_zset_name(record.chain_id))
            .key(
                self.keys
                    .created_extension_zset_name(record.extension.as_deref().unwrap_or_default()),
            )
            .arg(&record.id)
            .arg(serde_json::to_string(record)?)
            .arg(record.status.as_str())
            .arg(record.revision)
            .arg(record.created_at)
            .arg(if record.extension.is_some() { "1" } else { "0" })
            .invoke_async(&mut self.redis.clone())
            .await?;

        if inserted == 0 {
            return Err(TransactionStoreError::AlreadyExists {
                transaction_id: record.id.clone(),
            });
        }

        Ok(())
    }

    async fn get(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn
            .hget(self.keys.transaction_key_name(transaction_id), "data")
            .await?;

        data.map(|json| serde_json::from_str(&json).map_err(TransactionStoreError::from))
            .transpose()
    }

    async fn update(
        &self,
        current: &TransactionRecord,
        next: &TransactionRecord,
    ) -> Result<TransactionRecord, TransactionStoreError> {
        check_update(current, next)?;

        let mut next = next.clone();
        next.revision = current.revision + 1;

        let script = redis::Script::new(
            r#"
            local tx_key = KEYS[1]
            local old_status_zset = KEYS[2]
            local new_status_zset = KEYS[3]
            local nonces_zset = KEYS[4]
            local old_created_status_zset = KEYS[5]
            local new_created_status_zset = KEYS[6]
            local deployed_zset = KEYS[7]

            local id = ARGV[1]
            local expected_revision = ARGV[2]
            local data = ARGV[3]
            local status = ARGV[4]
            local revision = ARGV[5]
            local nonce = ARGV[6]
            local created_at = ARGV[7]
            local deployed = ARGV[8]

            local stored_revision = redis.call('HGET', tx_key, 'revision')
            if not stored_revision then
                return -1
            end
            if stored_revision ~= expected_revision then
                return 0
            end

            local seq = redis.call('HGET', tx_key, 'seq')
            redis.call('HSET', tx_key, 'data', data, 'status', status, 'revision', revision)

            if old_status_zset ~= new_status_zset then
                redis.call('ZREM', old_status_zset, id)
                redis.call('ZADD', new_status_zset, seq, id)
                redis.call('ZREM', old_created_status_zset, id)
                redis.call('ZADD', new_created_status_zset, created_at, id)
            end

            if deployed == '1' then
                redis.call('ZADD', deployed_zset, created_at, id)
            end

            if nonce ~= '' then
                redis.call('ZADD', nonces_zset, nonce, id)
            else
                redis.call('ZREM', nonces_zset, id)
            end

            return 1
            "#,
        );

        let result: i32 = script
            .key(self.keys.transaction_key_name(&current.id))
            .key(self.keys.status_zset_name(current.status))
            .key(self.keys.status_zset_name(next.status))
            .key(self.keys.wallet_nonces_zset_name(next.wallet_key()))
            .key(self.keys.created_status_zset_name(current.status))
            .key(self.keys.created_status_zset_name(next.status))
            .key(self.keys.deployed_zset_name())
            .arg(&current.id)
            .arg(current.revision)
            .arg(serde_json::to_string(&next)?)
            .arg(next.status.as_str())
            .arg(next.revision)
            .arg(next.nonce.map(|n| n.to_string()).unwrap_or_default())
            .arg(next.created_at)
            .arg(if next.deployed_contract_address.is_some() { "1" } else { "0" })
            .invoke_async(&mut self.redis.clone())
            .await?;

        match result {
            1 => Ok(next),
            0 => Err(TransactionStoreError::RevisionConflict {
                transaction_id: current.id.clone(),
                expected: current.revision,
            }),
            _ => Err(TransactionStoreError::TransactionNotFound {
                transaction_id: current.id.clone(),
            }),
        }
    }

    async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, TransactionStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stop = isize::try_from(limit).map_or(-1, |limit| limit - 1);
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(self.keys.status_zset_name(status), 0, stop)
            .await?;

        // A record can move between reading the index and loading it
        Ok(self
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|record| record.status == status)
            .collect())
    }

    async fn count_by_status(
        &self,
        status: TransactionStatus,
    ) -> Result<u64, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let count: u64 = conn.zcard(self.keys.status_zset_name(status)).await?;
        Ok(count)
    }

    /// Pages in Redis over the creation-time indexes. Several filters are
    /// intersected server side into a scratch key that lives for one call.
    async fn query(
        &self,
        query: &TransactionQuery,
    ) -> Result<TransactionPage, TransactionStoreError> {
        let script = redis::Script::new(
            r#"
            local scratch = KEYS[#KEYS]
            local index_count = #KEYS - 1
            local min = ARGV[1]
            local max = ARGV[2]
            local offset = ARGV[3]
            local count = ARGV[4]

            local source = KEYS[1]
            if index_count > 1 then
                local args = {'ZINTERSTORE', scratch, index_count}
                for i = 1, index_count do
                    table.insert(args, KEYS[i])
                end
                table.insert(args, 'AGGREGATE')
                table.insert(args, 'MAX')
                redis.call(unpack(args))
                source = scratch
            end

            local total = redis.call('ZCOUNT', source, min, max)
            local ids = redis.call('ZRANGEBYSCORE', source, min, max, 'LIMIT', offset, count)
            if source == scratch then
                redis.call('DEL', scratch)
            end
            return {total, ids}
            "#,
        );

        let mut indexes = Vec::new();
        if let Some(status) = query.status {
            indexes.push(self.keys.created_status_zset_name(status));
        }
        if let Some(extension) = &query.extension {
            indexes.push(self.keys.created_extension_zset_name(extension));
        }
        if let Some(chain_id) = query.chain_id {
            indexes.push(self.keys.created_chain_zset_name(chain_id));
        }
        if query.deployed_only {
            indexes.push(self.keys.deployed_zset_name());
        }
        if indexes.is_empty() {
            indexes.push(self.keys.created_zset_name());
        }

        let min = query
            .from_time
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-inf".to_string());
        let max = query
            .to_time
            .map(|t| t.to_string())
            .unwrap_or_else(|| "+inf".to_string());

        let mut invocation = script.prepare_invoke();
        for index in &indexes {
            invocation.key(index);
        }
        invocation
            .key(
                self.keys
                    .query_scratch_key_name(&uuid::Uuid::new_v4().simple().to_string()),
            )
            .arg(min)
            .arg(max)
            .arg(query.offset())
            .arg(query.limit());

        let (total_count, ids): (u64, Vec<String>) =
            invocation.invoke_async(&mut self.redis.clone()).await?;

        // A record can change status between the index read and the load
        let transactions = self
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|record| query.matches(record))
            .collect();

        Ok(TransactionPage {
            transactions,
            page: query.page(),
            limit: query.limit(),
            total_count,
        })
    }

    async fn records_with_nonces(
        &self,
        wallet: WalletKey,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransactionRecord>, TransactionStoreError> {
        if to <= from {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.wallet_nonces_zset_name(wallet), from, to - 1)
            .await?;

        Ok(self
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|record| record.nonce.is_some_and(|n| n >= from && n < to))
            .collect())
    }

    async fn get_nonce_state(
        &self,
        wallet: WalletKey,
    ) -> Result<Option<NonceState>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.keys.nonce_state_key_name(wallet)).await?;

        raw.map(|json| serde_json::from_str(&json).map_err(TransactionStoreError::from))
            .transpose()
    }

    async fn set_nonce_state(
        &self,
        wallet: WalletKey,
        state: &NonceState,
    ) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set(
                self.keys.nonce_state_key_name(wallet),
                serde_json::to_string(state)?,
            )
            .await?;
        Ok(())
    }

    async fn clear_nonce_state(&self, wallet: WalletKey) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(self.keys.nonce_state_key_name(wallet)).await?;
        Ok(())
    }

    async fn put_borrowed(
        &self,
        borrowed: &BorrowedTransaction,
    ) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(
                self.keys.borrowed_hashmap_name(),
                &borrowed.transaction_id,
                serde_json::to_string(borrowed)?,
            )
            .await?;
        Ok(())
    }

    async fn remove_borrowed(&self, transaction_id: &str) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hdel(self.keys.borrowed_hashmap_name(), transaction_id)
            .await?;
        Ok(())
    }

    async fn list_borrowed(&self) -> Result<Vec<BorrowedTransaction>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn.hvals(self.keys.borrowed_hashmap_name()).await?;

        let mut borrowed = raw
            .iter()
            .map(|json| serde_json::from_str::<BorrowedTransaction>(json))
            .collect::<Result<Vec<_>, _>>()?;
        borrowed.sort_by_key(|entry| (entry.wallet_key(), entry.nonce));
        Ok(borrowed)
    }

    async fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, TransactionStoreError> {
        let script = redis::Script::new(
            r#"
            local holder = redis.call('GET', KEYS[1])
            if (not holder) or holder == ARGV[1] then
                redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
                return 1
            end
            return 0
            "#,
        );

        let acquired: i32 = script
            .key(self.keys.lease_key_name(name))
            .arg(owner)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut self.redis.clone())
            .await?;

        Ok(acquired == 1)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<(), TransactionStoreError> {
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('DEL', KEYS[1])
            end
            return 1
            "#,
        );

        let _: i32 = script
            .key(self.keys.lease_key_name(name))
            .arg(owner)
            .invoke_async(&mut self.redis.clone())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn keys_are_namespaced() {
        let keys = StoreKeys::new(Some("prod".to_string()));
        assert_eq!(keys.transaction_key_name("abc"), "prod:relayer:tx:abc");
        assert_eq!(
            keys.status_zset_name(TransactionStatus::Submitted),
            "prod:relayer:status:submitted"
        );

        let wallet = WalletKey {
            chain_id: 10,
            wallet: address!("0x1000000000000000000000000000000000000001"),
        };
        assert_eq!(
            keys.wallet_nonces_zset_name(wallet),
            "prod:relayer:nonces:10:0x1000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn keys_without_namespace() {
        let keys = StoreKeys::new(None);
        assert_eq!(keys.borrowed_hashmap_name(), "relayer:borrowed");
        assert_eq!(keys.lease_key_name("worker"), "relayer:lease:worker");
    }

    #[test]
    fn query_indexes_are_namespaced() {
        let keys = StoreKeys::new(Some("prod".to_string()));
        assert_eq!(
            keys.created_status_zset_name(TransactionStatus::Mined),
            "prod:relayer:created:status:mined"
        );
        assert_eq!(keys.created_chain_zset_name(137), "prod:relayer:created:chain:137");
        assert_eq!(
            keys.created_extension_zset_name("mint"),
            "prod:relayer:created:extension:mint"
        );
        assert_eq!(keys.deployed_zset_name(), "prod:relayer:created:deployed");
    }
}

//! 会话与吊销缓存：记录已签发令牌，判定令牌是否仍可用。

mod redis;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::{clock::Clock, error::StoreError, token::TokenType};

pub(crate) use self::redis::RedisSessionCache;

/// 单个令牌的会话记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionRecord {
    pub(crate) token_id: String,
    pub(crate) identity_id: Uuid,
    pub(crate) token_type: TokenType,
    /// 令牌过期时间（unix 秒）。
    pub(crate) expires_at: u64,
    #[serde(default)]
    pub(crate) revoked: bool,
    /// 同批签发的配对令牌（access ⇄ refresh）。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) sibling_id: Option<String>,
}

/// 会话缓存接口。所有写操作在返回前已对其他调用方可见。
#[async_trait]
pub(crate) trait SessionCache: Send + Sync {
    /// 写入记录；已吊销的记录不会因重写而恢复。
    async fn record(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// 读取仍在保留期内的记录。
    async fn get(&self, token_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// 吊销令牌，幂等。
    async fn revoke(&self, token_id: &str) -> Result<(), StoreError>;

    /// 原子地把可用令牌置为已吊销；仅首次调用返回 true。
    async fn consume(&self, token_id: &str) -> Result<bool, StoreError>;

    /// 原子改写配对令牌：仅当记录可用且当前配对等于 `expected` 时生效。
    async fn relink(
        &self,
        token_id: &str,
        expected: Option<&str>,
        sibling: &str,
    ) -> Result<bool, StoreError>;

    /// 未知或已过保留期的令牌视为已吊销。
    async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError>;

    /// 吊销某身份下全部可用令牌，返回本次新吊销数量。
    async fn revoke_identity(&self, identity_id: Uuid) -> Result<usize, StoreError>;

    /// 清理过期条目，返回清理数量。
    async fn sweep(&self) -> Result<usize, StoreError>;

    /// 后端名称，用于日志。
    fn backend(&self) -> &'static str;
}

/// 进程内实现：单实例部署与测试使用。
pub(crate) struct MemorySessionCache {
    records: RwLock<HashMap<String, SessionRecord>>,
    clock: Arc<dyn Clock>,
    grace_sec: u64,
}

impl MemorySessionCache {
    pub(crate) fn new(clock: Arc<dyn Clock>, grace_sec: u64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
            grace_sec,
        }
    }

    fn is_live(&self, record: &SessionRecord, now: u64) -> bool {
        now < record.expires_at.saturating_add(self.grace_sec)
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn record(&self, mut record: SessionRecord) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.token_id)
            && self.is_live(existing, now)
        {
            record.revoked |= existing.revoked;
        }
        records.insert(record.token_id.clone(), record);
        Ok(())
    }

    async fn get(&self, token_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let now = self.clock.now();
        let records = self.records.read().await;
        Ok(records
            .get(token_id)
            .filter(|record| self.is_live(record, now))
            .cloned())
    }

    async fn revoke(&self, token_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(token_id)
            && now < record.expires_at.saturating_add(self.grace_sec)
        {
            record.revoked = true;
        }
        Ok(())
    }

    async fn consume(&self, token_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        match records.get_mut(token_id) {
            Some(record)
                if !record.revoked && now < record.expires_at.saturating_add(self.grace_sec) =>
            {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn relink(
        &self,
        token_id: &str,
        expected: Option<&str>,
        sibling: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;
        match records.get_mut(token_id) {
            Some(record)
                if !record.revoked
                    && now < record.expires_at.saturating_add(self.grace_sec)
                    && record.sibling_id.as_deref() == expected =>
            {
                record.sibling_id = Some(sibling.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let records = self.records.read().await;
        Ok(match records.get(token_id) {
            Some(record) => record.revoked || !self.is_live(record, now),
            None => true,
        })
    }

    async fn revoke_identity(&self, identity_id: Uuid) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let grace = self.grace_sec;
        let mut records = self.records.write().await;
        let mut revoked = 0;
        for record in records.values_mut() {
            if record.identity_id == identity_id
                && !record.revoked
                && now < record.expires_at.saturating_add(grace)
            {
                record.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let grace = self.grace_sec;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| now < record.expires_at.saturating_add(grace));
        Ok(before - records.len())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{MemorySessionCache, SessionCache, SessionRecord};
    use crate::auth::{clock::ManualClock, token::TokenType};

    const T0: u64 = 1_700_000_000;

    fn record(token_id: &str, identity_id: Uuid, ttl: u64) -> SessionRecord {
        SessionRecord {
            token_id: token_id.to_string(),
            identity_id,
            token_type: TokenType::Access,
            expires_at: T0 + ttl,
            revoked: false,
            sibling_id: None,
        }
    }

    fn cache() -> (Arc<ManualClock>, MemorySessionCache) {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = MemorySessionCache::new(clock.clone(), 30);
        (clock, cache)
    }

    #[tokio::test]
    async fn unknown_token_is_revoked() {
        let (_, cache) = cache();
        assert!(cache.is_revoked("never-issued").await.unwrap());
        assert!(cache.get("never-issued").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let (_, cache) = cache();
        let id = Uuid::new_v4();
        cache.record(record("a", id, 60)).await.unwrap();
        assert!(!cache.is_revoked("a").await.unwrap());

        cache.revoke("a").await.unwrap();
        let once = cache.get("a").await.unwrap();
        cache.revoke("a").await.unwrap();
        let twice = cache.get("a").await.unwrap();
        assert_eq!(once, twice);
        assert!(cache.is_revoked("a").await.unwrap());
        cache.revoke("missing").await.unwrap();
    }

    #[tokio::test]
    async fn rerecord_does_not_resurrect_revoked_token() {
        let (_, cache) = cache();
        let id = Uuid::new_v4();
        cache.record(record("a", id, 60)).await.unwrap();
        cache.revoke("a").await.unwrap();
        cache.record(record("a", id, 60)).await.unwrap();
        assert!(cache.is_revoked("a").await.unwrap());
    }

    #[tokio::test]
    async fn consume_succeeds_once() {
        let (_, cache) = cache();
        cache
            .record(record("r", Uuid::new_v4(), 60))
            .await
            .unwrap();
        assert!(cache.consume("r").await.unwrap());
        assert!(!cache.consume("r").await.unwrap());
        assert!(!cache.consume("missing").await.unwrap());
    }

    #[tokio::test]
    async fn relink_only_applies_to_expected_sibling() {
        let (_, cache) = cache();
        let mut refresh = record("r", Uuid::new_v4(), 600);
        refresh.sibling_id = Some("a1".to_string());
        cache.record(refresh).await.unwrap();

        assert!(!cache.relink("r", Some("stale"), "a2").await.unwrap());
        assert!(cache.relink("r", Some("a1"), "a2").await.unwrap());
        assert!(!cache.relink("r", Some("a1"), "a3").await.unwrap());
        assert_eq!(
            cache.get("r").await.unwrap().unwrap().sibling_id.as_deref(),
            Some("a2")
        );

        cache.revoke("r").await.unwrap();
        assert!(!cache.relink("r", Some("a2"), "a4").await.unwrap());
        assert!(!cache.relink("missing", None, "a5").await.unwrap());
    }

    #[tokio::test]
    async fn records_expire_after_grace_and_are_swept() {
        let (clock, cache) = cache();
        let id = Uuid::new_v4();
        cache.record(record("short", id, 10)).await.unwrap();
        cache.record(record("long", id, 600)).await.unwrap();

        clock.advance(35);
        assert!(!cache.is_revoked("short").await.unwrap());
        clock.advance(10);
        assert!(cache.is_revoked("short").await.unwrap());
        assert_eq!(cache.sweep().await.unwrap(), 1);
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_identity_only_touches_that_identity() {
        let (_, cache) = cache();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        cache.record(record("a1", alice, 60)).await.unwrap();
        cache.record(record("a2", alice, 60)).await.unwrap();
        cache.record(record("b1", bob, 60)).await.unwrap();

        assert_eq!(cache.revoke_identity(alice).await.unwrap(), 2);
        assert_eq!(cache.revoke_identity(alice).await.unwrap(), 0);
        assert!(cache.is_revoked("a1").await.unwrap());
        assert!(cache.is_revoked("a2").await.unwrap());
        assert!(!cache.is_revoked("b1").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_consumers_win_exactly_once() {
        let (_, cache) = cache();
        let cache = Arc::new(cache);
        cache
            .record(record("r", Uuid::new_v4(), 60))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.consume("r").await.unwrap() }));
        }
        let mut wins = 0;
        for task in tasks {
            if task.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}

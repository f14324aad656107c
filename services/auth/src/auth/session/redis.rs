//! Redis 会话缓存：会话 JSON、吊销标记与身份索引均使用原生 TTL。

use std::sync::Arc;

use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use tracing::debug;
use uuid::Uuid;

use super::{SessionCache, SessionRecord};
use crate::auth::{clock::Clock, error::StoreError};

const SESSION_PREFIX: &str = "auth:session:";
const REVOKED_PREFIX: &str = "auth:revoked:";
const IDENTITY_PREFIX: &str = "auth:identity:";
const SCAN_BATCH: usize = 200;

/// KEYS: session, identity index, revoked marker.
/// ARGV: json, ttl ms, revoked flag, jti.
const RECORD_SCRIPT: &str = r"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
if ARGV[3] == '1' then
  redis.call('SET', KEYS[3], '1', 'PX', ARGV[2])
end
redis.call('SADD', KEYS[2], ARGV[4])
if redis.call('PTTL', KEYS[2]) < tonumber(ARGV[2]) then
  redis.call('PEXPIRE', KEYS[2], ARGV[2])
end
return 1
";

/// KEYS: session, revoked marker。返回 1 表示本次新吊销。
const REVOKE_SCRIPT: &str = r"
local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then
  return 0
end
if redis.call('SET', KEYS[2], '1', 'NX', 'PX', ttl) then
  return 1
end
return 0
";

/// KEYS: session, revoked marker. ARGV: expected sibling（空串表示无）, new sibling.
const RELINK_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw or redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
local record = cjson.decode(raw)
if (record['siblingId'] or '') ~= ARGV[1] then
  return 0
end
record['siblingId'] = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(record), 'KEEPTTL')
return 1
";

/// KEYS: identity index. ARGV: session prefix, revoked prefix.
const REVOKE_IDENTITY_SCRIPT: &str = r"
local revoked = 0
for _, jti in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local ttl = redis.call('PTTL', ARGV[1] .. jti)
  if ttl > 0 then
    if redis.call('SET', ARGV[2] .. jti, '1', 'NX', 'PX', ttl) then
      revoked = revoked + 1
    end
  else
    redis.call('SREM', KEYS[1], jti)
  end
end
return revoked
";

/// KEYS: identity index. ARGV: session prefix.
const PRUNE_INDEX_SCRIPT: &str = r"
local removed = 0
for _, jti in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. jti) == 0 then
    redis.call('SREM', KEYS[1], jti)
    removed = removed + 1
  end
end
return removed
";

pub(crate) struct RedisSessionCache {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
    grace_sec: u64,
    record_script: Script,
    revoke_script: Script,
    relink_script: Script,
    revoke_identity_script: Script,
    prune_index_script: Script,
}

impl RedisSessionCache {
    /// 建立连接；连接管理器在断线后自动重连。
    pub(crate) async fn connect(
        url: &str,
        clock: Arc<dyn Clock>,
        grace_sec: u64,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self {
            conn,
            clock,
            grace_sec,
            record_script: Script::new(RECORD_SCRIPT),
            revoke_script: Script::new(REVOKE_SCRIPT),
            relink_script: Script::new(RELINK_SCRIPT),
            revoke_identity_script: Script::new(REVOKE_IDENTITY_SCRIPT),
            prune_index_script: Script::new(PRUNE_INDEX_SCRIPT),
        })
    }

    /// 读取会话 JSON 与吊销标记。
    async fn load(
        &self,
        token_id: &str,
    ) -> Result<(Option<String>, Option<String>), StoreError> {
        let mut conn = self.conn.clone();
        let pair: (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(session_key(token_id))
            .arg(revoked_key(token_id))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(pair)
    }
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn record(&self, record: SessionRecord) -> Result<(), StoreError> {
        let ttl_ms = ttl_millis(record.expires_at, self.clock.now(), self.grace_sec);
        if ttl_ms == 0 {
            debug!("skip recording session {}: already past grace", record.token_id);
            return Ok(());
        }
        let payload = serde_json::to_string(&record)
            .map_err(|err| StoreError::Corrupt(format!("encode session failed: {err}")))?;

        let mut conn = self.conn.clone();
        let _: i64 = self
            .record_script
            .key(session_key(&record.token_id))
            .key(identity_key(record.identity_id))
            .key(revoked_key(&record.token_id))
            .arg(payload)
            .arg(ttl_ms)
            .arg(if record.revoked { "1" } else { "0" })
            .arg(&record.token_id)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, token_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let (session, marker) = self.load(token_id).await?;
        let Some(raw) = session else {
            return Ok(None);
        };
        let mut record: SessionRecord = serde_json::from_str(&raw)
            .map_err(|err| StoreError::Corrupt(format!("decode session failed: {err}")))?;
        record.revoked |= marker.is_some();
        Ok(Some(record))
    }

    async fn revoke(&self, token_id: &str) -> Result<(), StoreError> {
        self.consume(token_id).await.map(|_| ())
    }

    async fn consume(&self, token_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let changed: i64 = self
            .revoke_script
            .key(session_key(token_id))
            .key(revoked_key(token_id))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(changed == 1)
    }

    async fn relink(
        &self,
        token_id: &str,
        expected: Option<&str>,
        sibling: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let changed: i64 = self
            .relink_script
            .key(session_key(token_id))
            .key(revoked_key(token_id))
            .arg(expected.unwrap_or_default())
            .arg(sibling)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(changed == 1)
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError> {
        let (session, marker) = self.load(token_id).await?;
        Ok(session.is_none() || marker.is_some())
    }

    async fn revoke_identity(&self, identity_id: Uuid) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let revoked: i64 = self
            .revoke_identity_script
            .key(identity_key(identity_id))
            .arg(SESSION_PREFIX)
            .arg(REVOKED_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(usize::try_from(revoked).unwrap_or_default())
    }

    async fn sweep(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{IDENTITY_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            for key in keys {
                let pruned: i64 = self
                    .prune_index_script
                    .key(&key)
                    .arg(SESSION_PREFIX)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(backend)?;
                removed += usize::try_from(pruned).unwrap_or_default();
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

fn session_key(token_id: &str) -> String {
    format!("{SESSION_PREFIX}{token_id}")
}

fn revoked_key(token_id: &str) -> String {
    format!("{REVOKED_PREFIX}{token_id}")
}

fn identity_key(identity_id: Uuid) -> String {
    format!("{IDENTITY_PREFIX}{identity_id}")
}

/// 剩余保留时间（毫秒）；0 表示已过保留期。
fn ttl_millis(expires_at: u64, now: u64, grace_sec: u64) -> u64 {
    expires_at
        .saturating_add(grace_sec)
        .saturating_sub(now)
        .saturating_mul(1000)
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(format!("redis: {err}"))
}

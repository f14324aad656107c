//! 鉴权引擎：登录、刷新、校验、登出，以及注册与账号维护。

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use auth_shared_protocol::normalize_username;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{
    clock::Clock,
    credentials::{AccountStatus, CredentialStore, HashAlg, Identity, NewIdentity, Role},
    error::{AuthError, StoreError},
    password::CredentialHasher,
    session::{SessionCache, SessionRecord},
    token::{Claims, TokenCodec, TokenType, new_token_id},
};

const MIN_PASSWORD_CHARS: usize = 8;
const MAX_PASSWORD_CHARS: usize = 256;
const MAX_EMAIL_LEN: usize = 254;
const MAX_NICKNAME_CHARS: usize = 64;
/// 非轮换刷新时改写 refresh 配对的最大尝试次数。
const RELINK_ATTEMPTS: usize = 8;
/// access token 扩展字段：同批签发的 refresh token ID。
pub(crate) const REFRESH_ID_CLAIM: &str = "rid";

/// 令牌签发策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TokenPolicy {
    pub(crate) access_ttl_sec: u64,
    pub(crate) refresh_ttl_sec: u64,
    /// 刷新时是否轮换 refresh token。
    pub(crate) rotate_refresh: bool,
    /// 单次存储/缓存调用超时。
    pub(crate) backend_timeout: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            access_ttl_sec: 15 * 60,
            refresh_ttl_sec: 14 * 24 * 60 * 60,
            rotate_refresh: true,
            backend_timeout: Duration::from_secs(2),
        }
    }
}

/// 登录流程阶段，失败时记录所处阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginStage {
    Pending,
    CredentialChecked,
    TokenIssued,
    SessionRecorded,
    Complete,
    Failed,
}

/// 一次签发的令牌及其 claims。
#[derive(Debug, Clone)]
pub(crate) struct IssuedTokens {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) access_claims: Claims,
    pub(crate) refresh_claims: Claims,
}

pub(crate) struct AuthEngine {
    codec: TokenCodec,
    sessions: Arc<dyn SessionCache>,
    credentials: Arc<dyn CredentialStore>,
    hasher: CredentialHasher,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
}

impl AuthEngine {
    pub(crate) fn new(
        codec: TokenCodec,
        sessions: Arc<dyn SessionCache>,
        credentials: Arc<dyn CredentialStore>,
        hasher: CredentialHasher,
        clock: Arc<dyn Clock>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            codec,
            sessions,
            credentials,
            hasher,
            clock,
            policy,
        }
    }

    /// 当前后端组合，用于启动日志与健康检查。
    pub(crate) fn backends(&self) -> (&'static str, &'static str) {
        (self.credentials.backend(), self.sessions.backend())
    }

    /// 账号口令登录。除依赖故障外，所有失败对外都是 `AuthenticationFailed`。
    pub(crate) async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<IssuedTokens, AuthError> {
        let username = normalize_username(username);
        let mut stage = LoginStage::Pending;
        let result = self.run_login(&username, password, &mut stage).await;
        match result {
            Ok(issued) => {
                info!(
                    "login complete: identity={} access={}",
                    issued.access_claims.sub, issued.access_claims.jti
                );
                Ok(issued)
            }
            Err(err) => {
                let failed_at = stage;
                stage = LoginStage::Failed;
                warn!("login {stage:?} after {failed_at:?}: {err}");
                if err.is_retryable() || matches!(err, AuthError::Internal(_)) {
                    Err(err)
                } else {
                    Err(AuthError::AuthenticationFailed)
                }
            }
        }
    }

    async fn run_login(
        &self,
        username: &str,
        password: &str,
        stage: &mut LoginStage,
    ) -> Result<IssuedTokens, AuthError> {
        let identity = if username.is_empty() {
            None
        } else {
            self.call(
                "find identity",
                self.credentials.find_by_username(username),
            )
            .await?
        };
        let Some(identity) = identity else {
            // 未知用户同样付出一次哈希成本。
            self.hasher.verify_dummy(password).await?;
            debug!("login rejected: unknown username");
            return Err(AuthError::AuthenticationFailed);
        };

        let matched = self
            .hasher
            .verify(&identity.credential_hash, identity.hash_alg, password)
            .await?;
        if !matched {
            debug!("login rejected: password mismatch for {}", identity.id);
            return Err(AuthError::AuthenticationFailed);
        }
        if identity.status != AccountStatus::Active {
            debug!(
                "login rejected: identity {} is {}",
                identity.id,
                identity.status.as_str()
            );
            return Err(AuthError::AccountLocked);
        }
        *stage = LoginStage::CredentialChecked;

        let issued = self.issue_pair(&identity)?;
        *stage = LoginStage::TokenIssued;

        self.record_pair(&issued).await?;
        // 锁定与批量吊销可能发生在状态检查之后、会话写入之前。
        let current = self
            .call("recheck identity", self.credentials.find_by_id(identity.id))
            .await?;
        if current.is_none_or(|current| current.status != AccountStatus::Active) {
            self.revoke_pair(&issued).await?;
            debug!("login rejected: identity {} changed status during login", identity.id);
            return Err(AuthError::AccountLocked);
        }
        *stage = LoginStage::SessionRecorded;

        self.upgrade_hash(&identity, password).await;
        *stage = LoginStage::Complete;
        Ok(issued)
    }

    /// 用 refresh token 换取新的 access token；默认同时轮换 refresh token。
    pub(crate) async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens, AuthError> {
        let claims = self.codec.verify(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::Malformed(format!(
                "expected a refresh token, got {}",
                claims.token_type.as_str()
            )));
        }
        let identity_id = claims.identity_id()?;

        let record = self
            .call("load refresh session", self.sessions.get(&claims.jti))
            .await?;
        let Some(record) = record.filter(|record| !record.revoked) else {
            debug!("refresh rejected: {} revoked or unknown", claims.jti);
            return Err(AuthError::Revoked);
        };

        let identity = self
            .call("load identity", self.credentials.find_by_id(identity_id))
            .await?
            .ok_or(AuthError::Revoked)?;
        if identity.status != AccountStatus::Active {
            self.call("revoke refresh", self.sessions.revoke(&claims.jti))
                .await?;
            return Err(AuthError::AccountLocked);
        }

        if self.policy.rotate_refresh {
            // 先原子消费旧 refresh token，并发重放只有一个能成功。
            if !self
                .call("consume refresh", self.sessions.consume(&claims.jti))
                .await?
            {
                debug!("refresh rejected: {} already consumed", claims.jti);
                return Err(AuthError::Revoked);
            }
            if let Some(previous_access) = &record.sibling_id {
                self.call("revoke access", self.sessions.revoke(previous_access))
                    .await?;
            }
            let issued = self.issue_pair(&identity)?;
            self.record_pair(&issued).await?;
            info!(
                "refresh rotated: identity={} refresh={} -> {}",
                identity.id, claims.jti, issued.refresh_claims.jti
            );
            return Ok(issued);
        }

        let access_claims = self.access_claims(&identity, self.clock.now(), &claims.jti);
        let access_token = self.codec.issue(&access_claims)?;
        self.call(
            "record access",
            self.sessions.record(SessionRecord {
                token_id: access_claims.jti.clone(),
                identity_id,
                token_type: TokenType::Access,
                expires_at: access_claims.exp,
                revoked: false,
                sibling_id: Some(claims.jti.clone()),
            }),
        )
        .await?;
        let previous_access = self
            .relink_refresh(&claims.jti, record.sibling_id, &access_claims.jti)
            .await?;
        if let Some(previous_access) = &previous_access {
            self.call("revoke access", self.sessions.revoke(previous_access))
                .await?;
        }
        info!(
            "refresh issued access {} for identity={}",
            access_claims.jti, identity.id
        );
        Ok(IssuedTokens {
            access_token,
            refresh_token: refresh_token.trim().to_string(),
            access_claims,
            refresh_claims: claims,
        })
    }

    /// 校验 access token：签名、过期、类型、吊销状态。
    pub(crate) async fn validate(&self, access_token: &str) -> Result<Claims, AuthError> {
        let claims = self.codec.verify(access_token)?;
        if claims.token_type != TokenType::Access {
            return Err(AuthError::Malformed(format!(
                "expected an access token, got {}",
                claims.token_type.as_str()
            )));
        }
        if self
            .call("check revocation", self.sessions.is_revoked(&claims.jti))
            .await?
        {
            return Err(AuthError::Revoked);
        }
        Ok(claims)
    }

    /// 吊销令牌及其配对令牌，幂等。
    pub(crate) async fn logout(&self, token_id: &str) -> Result<(), AuthError> {
        let record = self
            .call("load session", self.sessions.get(token_id))
            .await?;
        self.call("revoke token", self.sessions.revoke(token_id))
            .await?;
        if let Some(sibling) = record.and_then(|record| record.sibling_id) {
            self.call("revoke sibling", self.sessions.revoke(&sibling))
                .await?;
        }
        info!("logout: revoked {token_id} and its sibling");
        Ok(())
    }

    /// 按令牌登出；已过期的 access token 仍可用于吊销其 refresh token。
    pub(crate) async fn logout_token(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.codec.verify_ignoring_expiry(token)?;
        self.logout(&claims.jti).await?;
        // access 会话记录可能已随 TTL 消失，按 claims 中的配对 ID 兜底吊销。
        if let Some(Value::String(refresh_id)) = claims.ext.get(REFRESH_ID_CLAIM) {
            self.call("revoke refresh", self.sessions.revoke(refresh_id))
                .await?;
        }
        Ok(())
    }

    /// 注册本地账号。
    pub(crate) async fn signup(
        &self,
        email: &str,
        password: &str,
        nickname: &str,
    ) -> Result<Identity, AuthError> {
        let username = normalize_username(email);
        validate_email(&username)?;
        validate_password(password)?;
        let nickname = nickname.trim();
        if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_CHARS {
            return Err(AuthError::InvalidRequest("昵称不能为空且不超过 64 个字符"));
        }

        let credential_hash = self.hasher.hash(password).await?;
        let identity = self
            .call(
                "insert identity",
                self.credentials.insert(NewIdentity {
                    username,
                    nickname: nickname.to_string(),
                    role: Role::User,
                    credential_hash,
                    hash_alg: HashAlg::Argon2id,
                }),
            )
            .await?;
        info!("signup complete: identity={}", identity.id);
        Ok(identity)
    }

    pub(crate) async fn profile(&self, identity_id: Uuid) -> Result<Identity, AuthError> {
        self.call("load identity", self.credentials.find_by_id(identity_id))
            .await?
            .ok_or(AuthError::NotFound)
    }

    /// 修改口令，成功后吊销该身份全部会话。
    pub(crate) async fn change_password(
        &self,
        identity_id: Uuid,
        current: &str,
        new_password: &str,
    ) -> Result<usize, AuthError> {
        validate_password(new_password)?;
        let identity = self.profile(identity_id).await?;
        if !self
            .hasher
            .verify(&identity.credential_hash, identity.hash_alg, current)
            .await?
        {
            return Err(AuthError::AuthenticationFailed);
        }
        let credential_hash = self.hasher.hash(new_password).await?;
        self.call(
            "update credential",
            self.credentials
                .update_credential(identity_id, credential_hash, HashAlg::Argon2id),
        )
        .await?;
        let revoked = self
            .call(
                "revoke identity sessions",
                self.sessions.revoke_identity(identity_id),
            )
            .await?;
        info!("password changed: identity={identity_id} revoked_sessions={revoked}");
        Ok(revoked)
    }

    /// 修改账号状态；非 ACTIVE 时吊销全部会话。
    pub(crate) async fn set_status(
        &self,
        identity_id: Uuid,
        status: AccountStatus,
    ) -> Result<usize, AuthError> {
        self.call(
            "set status",
            self.credentials.set_status(identity_id, status),
        )
        .await?;
        let revoked = if status == AccountStatus::Active {
            0
        } else {
            self.call(
                "revoke identity sessions",
                self.sessions.revoke_identity(identity_id),
            )
            .await?
        };
        info!(
            "status changed: identity={identity_id} status={} revoked_sessions={revoked}",
            status.as_str()
        );
        Ok(revoked)
    }

    pub(crate) async fn sweep_sessions(&self) -> Result<usize, AuthError> {
        self.call("sweep sessions", self.sessions.sweep()).await
    }

    /// 存储/缓存调用统一加超时，失败映射为可重试的 `Unavailable`。
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.policy.backend_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if matches!(err, StoreError::Backend(_) | StoreError::Corrupt(_)) {
                    warn!("{op} failed: {err}");
                }
                Err(err.into())
            }
            Err(_) => {
                warn!(
                    "{op} timed out after {}ms",
                    self.policy.backend_timeout.as_millis()
                );
                Err(AuthError::Unavailable(format!("{op} timed out")))
            }
        }
    }

    fn access_claims(&self, identity: &Identity, now: u64, refresh_id: &str) -> Claims {
        let mut ext = BTreeMap::new();
        ext.insert(
            REFRESH_ID_CLAIM.to_string(),
            Value::String(refresh_id.to_string()),
        );
        Claims {
            sub: identity.id.to_string(),
            iss: self.codec.issuer().to_string(),
            iat: now,
            exp: now.saturating_add(self.policy.access_ttl_sec),
            jti: new_token_id(),
            token_type: TokenType::Access,
            email: Some(identity.username.clone()),
            role: Some(identity.role.as_str().to_string()),
            ext,
        }
    }

    fn issue_pair(&self, identity: &Identity) -> Result<IssuedTokens, AuthError> {
        let now = self.clock.now();
        let refresh_id = new_token_id();
        let access_claims = self.access_claims(identity, now, &refresh_id);
        let refresh_claims = Claims {
            sub: identity.id.to_string(),
            iss: self.codec.issuer().to_string(),
            iat: now,
            exp: now.saturating_add(self.policy.refresh_ttl_sec),
            jti: refresh_id,
            token_type: TokenType::Refresh,
            email: None,
            role: None,
            ext: BTreeMap::new(),
        };
        Ok(IssuedTokens {
            access_token: self.codec.issue(&access_claims)?,
            refresh_token: self.codec.issue(&refresh_claims)?,
            access_claims,
            refresh_claims,
        })
    }

    async fn record_pair(&self, issued: &IssuedTokens) -> Result<(), AuthError> {
        let identity_id = issued.access_claims.identity_id()?;
        for (claims, sibling) in [
            (&issued.access_claims, &issued.refresh_claims),
            (&issued.refresh_claims, &issued.access_claims),
        ] {
            self.call(
                "record session",
                self.sessions.record(SessionRecord {
                    token_id: claims.jti.clone(),
                    identity_id,
                    token_type: claims.token_type,
                    expires_at: claims.exp,
                    revoked: false,
                    sibling_id: Some(sibling.jti.clone()),
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn revoke_pair(&self, issued: &IssuedTokens) -> Result<(), AuthError> {
        for claims in [&issued.access_claims, &issued.refresh_claims] {
            self.call("revoke session", self.sessions.revoke(&claims.jti))
                .await?;
        }
        Ok(())
    }

    /// 把 refresh 记录的配对改为新 access token，返回被替换的配对。
    /// 并发刷新改写了配对时按最新值重试；refresh 已吊销则撤销新 access token。
    async fn relink_refresh(
        &self,
        refresh_id: &str,
        mut expected: Option<String>,
        access_id: &str,
    ) -> Result<Option<String>, AuthError> {
        for _ in 0..RELINK_ATTEMPTS {
            if self
                .call(
                    "relink refresh",
                    self.sessions
                        .relink(refresh_id, expected.as_deref(), access_id),
                )
                .await?
            {
                return Ok(expected);
            }
            let current = self
                .call("reload refresh session", self.sessions.get(refresh_id))
                .await?;
            match current.filter(|record| !record.revoked) {
                Some(current) => expected = current.sibling_id,
                None => {
                    self.call("revoke access", self.sessions.revoke(access_id))
                        .await?;
                    debug!("refresh rejected: {refresh_id} revoked during relink");
                    return Err(AuthError::Revoked);
                }
            }
        }
        self.call("revoke access", self.sessions.revoke(access_id))
            .await?;
        warn!("relink of {refresh_id} gave up after {RELINK_ATTEMPTS} attempts");
        Err(AuthError::Unavailable("refresh session is contended".to_string()))
    }

    /// 旧算法或旧参数的哈希在登录成功后升级；失败只记日志。
    async fn upgrade_hash(&self, identity: &Identity, password: &str) {
        if !self
            .hasher
            .needs_rehash(&identity.credential_hash, identity.hash_alg)
        {
            return;
        }
        let upgraded = match self.hasher.hash(password).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!("rehash for {} skipped: {err}", identity.id);
                return;
            }
        };
        match self
            .call(
                "upgrade credential",
                self.credentials
                    .update_credential(identity.id, upgraded, HashAlg::Argon2id),
            )
            .await
        {
            Ok(()) => info!(
                "credential of {} upgraded from {}",
                identity.id,
                identity.hash_alg.as_str()
            ),
            Err(err) => warn!("credential upgrade for {} failed: {err}", identity.id),
        }
    }
}

fn validate_email(username: &str) -> Result<(), AuthError> {
    let valid = username.len() <= MAX_EMAIL_LEN
        && !username.chars().any(char::is_whitespace)
        && username
            .split_once('@')
            .is_some_and(|(local, domain)| {
                !local.is_empty() && !domain.is_empty() && !domain.contains('@')
            });
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidRequest("邮箱格式不正确"))
    }
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    let chars = password.chars().count();
    if (MIN_PASSWORD_CHARS..=MAX_PASSWORD_CHARS).contains(&chars) {
        Ok(())
    } else {
        Err(AuthError::InvalidRequest("密码长度需在 8 到 256 个字符之间"))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex, OnceLock},
        time::Duration,
    };

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::{AuthEngine, TokenPolicy};
    use crate::auth::{
        clock::ManualClock,
        credentials::{
            AccountStatus, CredentialStore, HashAlg, MemoryCredentialStore, NewIdentity, Role,
        },
        error::{AuthError, StoreError},
        keys::{Algorithm, KeyEntry, KeyRing},
        password::{CredentialHasher, HashLimits, HashParams},
        session::{MemorySessionCache, SessionCache, SessionRecord},
        token::{TokenCodec, TokenType},
    };

    const T0: u64 = 1_700_000_000;
    const PASSWORD: &str = "correct-horse-battery";

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryCredentialStore>,
        engine: Arc<AuthEngine>,
    }

    fn harness_with(policy: TokenPolicy, sessions: Option<Arc<dyn SessionCache>>) -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let key = KeyEntry::hmac(
            Some("test"),
            Algorithm::Hs256,
            b"engine-test-secret-engine-test-secret",
        )
        .unwrap();
        let ring = KeyRing::new(key, vec![Algorithm::Hs256]).unwrap();
        let codec = TokenCodec::new(ring, clock.clone(), 5, "auth-service");
        let sessions =
            sessions.unwrap_or_else(|| Arc::new(MemorySessionCache::new(clock.clone(), 60)));
        let store = Arc::new(MemoryCredentialStore::new());
        let hasher = CredentialHasher::new(
            HashParams {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            HashLimits {
                max_concurrency: 4,
                max_queue: 64,
                queue_timeout: Duration::from_secs(5),
            },
        )
        .unwrap();
        let engine = AuthEngine::new(codec, sessions, store.clone(), hasher, clock.clone(), policy);
        Harness {
            clock,
            store,
            engine: Arc::new(engine),
        }
    }

    fn harness() -> Harness {
        harness_with(TokenPolicy::default(), None)
    }

    async fn signup(harness: &Harness) -> Uuid {
        harness
            .engine
            .signup("Alice@Example.com", PASSWORD, "Alice")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn access_token_expires_after_fifteen_minutes() {
        let h = harness();
        signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        assert_eq!(issued.access_claims.exp, T0 + 15 * 60);

        h.clock.advance(5 * 60);
        assert!(h.engine.validate(&issued.access_token).await.is_ok());
        h.clock.advance(11 * 60);
        assert_eq!(
            h.engine.validate(&issued.access_token).await.unwrap_err(),
            AuthError::Expired
        );
    }

    #[tokio::test]
    async fn revoked_refresh_token_issues_nothing() {
        let h = harness();
        signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        h.engine.logout(&issued.refresh_claims.jti).await.unwrap();

        assert_eq!(
            h.engine.refresh(&issued.refresh_token).await.unwrap_err(),
            AuthError::Revoked
        );
        assert_eq!(
            h.engine.validate(&issued.access_token).await.unwrap_err(),
            AuthError::Revoked
        );
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let h = harness();
        signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        h.engine.logout(&issued.access_claims.jti).await.unwrap();
        let first = h.engine.validate(&issued.access_token).await.unwrap_err();
        h.engine.logout(&issued.access_claims.jti).await.unwrap();
        let second = h.engine.validate(&issued.access_token).await.unwrap_err();
        assert_eq!(first, AuthError::Revoked);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn revocation_is_visible_to_concurrent_validators() {
        let h = harness();
        signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        h.engine.logout(&issued.access_claims.jti).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let engine = h.engine.clone();
            let token = issued.access_token.clone();
            tasks.push(tokio::spawn(async move { engine.validate(&token).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap_err(), AuthError::Revoked);
        }
    }

    #[tokio::test]
    async fn unknown_user_and_wrong_password_look_identical() {
        let h = harness();
        signup(&h).await;
        let hasher_before = h.engine.hasher.verified_count();

        let wrong = h
            .engine
            .login("alice@example.com", "wrong-password")
            .await
            .unwrap_err();
        let after_wrong = h.engine.hasher.verified_count();
        let unknown = h
            .engine
            .login("nobody@example.com", "wrong-password")
            .await
            .unwrap_err();
        let after_unknown = h.engine.hasher.verified_count();

        assert_eq!(wrong, AuthError::AuthenticationFailed);
        assert_eq!(wrong, unknown);
        assert_eq!(after_wrong - hasher_before, 1);
        assert_eq!(after_unknown - after_wrong, 1);
    }

    #[tokio::test]
    async fn locked_account_fails_login_generically() {
        let h = harness();
        let id = signup(&h).await;
        h.engine.set_status(id, AccountStatus::Locked).await.unwrap();
        assert_eq!(
            h.engine
                .login("alice@example.com", PASSWORD)
                .await
                .unwrap_err(),
            AuthError::AuthenticationFailed
        );
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_single_use() {
        let h = harness();
        signup(&h).await;
        let first = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        let second = h.engine.refresh(&first.refresh_token).await.unwrap();

        assert_ne!(second.refresh_token, first.refresh_token);
        assert_eq!(
            h.engine.refresh(&first.refresh_token).await.unwrap_err(),
            AuthError::Revoked
        );
        assert_eq!(
            h.engine.validate(&first.access_token).await.unwrap_err(),
            AuthError::Revoked
        );
        assert!(h.engine.validate(&second.access_token).await.is_ok());
        assert!(h.engine.refresh(&second.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_refresh_replay_yields_one_winner() {
        let h = harness();
        signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = h.engine.clone();
            let token = issued.refresh_token.clone();
            tasks.push(tokio::spawn(async move { engine.refresh(&token).await }));
        }
        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => wins += 1,
                Err(err) => assert_eq!(err, AuthError::Revoked),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn refresh_without_rotation_relinks_access_token() {
        let h = harness_with(
            TokenPolicy {
                rotate_refresh: false,
                ..TokenPolicy::default()
            },
            None,
        );
        signup(&h).await;
        let first = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        let second = h.engine.refresh(&first.refresh_token).await.unwrap();

        assert_eq!(second.refresh_token, first.refresh_token);
        assert_eq!(
            h.engine.validate(&first.access_token).await.unwrap_err(),
            AuthError::Revoked
        );
        assert!(h.engine.validate(&second.access_token).await.is_ok());

        h.engine.logout(&first.refresh_claims.jti).await.unwrap();
        assert_eq!(
            h.engine.validate(&second.access_token).await.unwrap_err(),
            AuthError::Revoked
        );
    }

    #[tokio::test]
    async fn concurrent_refresh_without_rotation_keeps_logout_complete() {
        let h = harness_with(
            TokenPolicy {
                rotate_refresh: false,
                ..TokenPolicy::default()
            },
            None,
        );
        signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = h.engine.clone();
            let token = issued.refresh_token.clone();
            tasks.push(tokio::spawn(async move { engine.refresh(&token).await }));
        }
        let mut accesses = Vec::new();
        for task in tasks {
            accesses.push(task.await.unwrap().unwrap().access_token);
        }
        assert_eq!(live_access_count(&h, &accesses).await, 1);

        h.engine.logout(&issued.refresh_claims.jti).await.unwrap();
        assert_eq!(live_access_count(&h, &accesses).await, 0);
    }

    /// 仍能通过校验的 access token 数量。
    async fn live_access_count(h: &Harness, tokens: &[String]) -> usize {
        let mut live = 0;
        for token in tokens {
            if h.engine.validate(token).await.is_ok() {
                live += 1;
            }
        }
        live
    }

    #[tokio::test]
    async fn refresh_rejects_access_tokens_and_locked_accounts() {
        let h = harness();
        let id = signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        assert!(matches!(
            h.engine.refresh(&issued.access_token).await,
            Err(AuthError::Malformed(_))
        ));
        assert!(matches!(
            h.engine.validate(&issued.refresh_token).await,
            Err(AuthError::Malformed(_))
        ));

        h.store.set_status(id, AccountStatus::Disabled).await.unwrap();
        assert_eq!(
            h.engine.refresh(&issued.refresh_token).await.unwrap_err(),
            AuthError::AccountLocked
        );
    }

    #[tokio::test]
    async fn logout_by_expired_access_token_revokes_refresh() {
        let h = harness();
        signup(&h).await;
        let issued = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        h.clock.advance(20 * 60);
        assert_eq!(
            h.engine.validate(&issued.access_token).await.unwrap_err(),
            AuthError::Expired
        );

        h.engine.logout_token(&issued.access_token).await.unwrap();
        assert_eq!(
            h.engine.refresh(&issued.refresh_token).await.unwrap_err(),
            AuthError::Revoked
        );
    }

    #[tokio::test]
    async fn password_change_revokes_every_session() {
        let h = harness();
        let id = signup(&h).await;
        let a = h.engine.login("alice@example.com", PASSWORD).await.unwrap();
        let b = h.engine.login("alice@example.com", PASSWORD).await.unwrap();

        assert_eq!(
            h.engine
                .change_password(id, "not-the-password", "new-password-123")
                .await
                .unwrap_err(),
            AuthError::AuthenticationFailed
        );
        let revoked = h
            .engine
            .change_password(id, PASSWORD, "new-password-123")
            .await
            .unwrap();
        assert_eq!(revoked, 4);
        for token in [&a.access_token, &b.access_token] {
            assert_eq!(
                h.engine.validate(token).await.unwrap_err(),
                AuthError::Revoked
            );
        }
        assert!(h.engine.login("alice@example.com", PASSWORD).await.is_err());
        assert!(
            h.engine
                .login("alice@example.com", "new-password-123")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn legacy_bcrypt_hash_is_upgraded_on_login() {
        let h = harness();
        let created = h
            .store
            .insert(NewIdentity {
                username: "legacy@example.com".to_string(),
                nickname: "Legacy".to_string(),
                role: Role::User,
                credential_hash: bcrypt::hash(PASSWORD, 4).unwrap(),
                hash_alg: HashAlg::Bcrypt,
            })
            .await
            .unwrap();

        h.engine.login("legacy@example.com", PASSWORD).await.unwrap();
        let upgraded = h.store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(upgraded.hash_alg, HashAlg::Argon2id);
        assert!(upgraded.credential_hash.starts_with("$argon2id$"));
        assert!(h.engine.login("legacy@example.com", PASSWORD).await.is_ok());
    }

    #[tokio::test]
    async fn signup_validates_input_and_rejects_duplicates() {
        let h = harness();
        assert!(matches!(
            h.engine.signup("not-an-email", PASSWORD, "A").await,
            Err(AuthError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.engine.signup("a@b.c", "short", "A").await,
            Err(AuthError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.engine.signup("a@b.c", PASSWORD, "  ").await,
            Err(AuthError::InvalidRequest(_))
        ));
        signup(&h).await;
        assert_eq!(
            h.engine
                .signup(" alice@EXAMPLE.com", PASSWORD, "Again")
                .await
                .unwrap_err(),
            AuthError::Conflict
        );
    }

    struct StalledSessions;

    #[async_trait]
    impl SessionCache for StalledSessions {
        async fn record(&self, _record: SessionRecord) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _token_id: &str) -> Result<Option<SessionRecord>, StoreError> {
            std::future::pending().await
        }
        async fn revoke(&self, _token_id: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn consume(&self, _token_id: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn relink(
            &self,
            _token_id: &str,
            _expected: Option<&str>,
            _sibling: &str,
        ) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn is_revoked(&self, _token_id: &str) -> Result<bool, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn revoke_identity(&self, _identity_id: Uuid) -> Result<usize, StoreError> {
            std::future::pending().await
        }
        async fn sweep(&self) -> Result<usize, StoreError> {
            std::future::pending().await
        }
        fn backend(&self) -> &'static str {
            "stalled"
        }
    }

    /// 写入 access 会话前模拟管理员锁定账号并批量吊销。
    struct LockBeforeAccessRecorded {
        inner: MemorySessionCache,
        store: OnceLock<Arc<MemoryCredentialStore>>,
        recorded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionCache for LockBeforeAccessRecorded {
        async fn record(&self, record: SessionRecord) -> Result<(), StoreError> {
            if record.token_type == TokenType::Access
                && let Some(store) = self.store.get()
            {
                store
                    .set_status(record.identity_id, AccountStatus::Locked)
                    .await?;
                self.inner.revoke_identity(record.identity_id).await?;
            }
            self.recorded.lock().unwrap().push(record.token_id.clone());
            self.inner.record(record).await
        }
        async fn get(&self, token_id: &str) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.get(token_id).await
        }
        async fn revoke(&self, token_id: &str) -> Result<(), StoreError> {
            self.inner.revoke(token_id).await
        }
        async fn consume(&self, token_id: &str) -> Result<bool, StoreError> {
            self.inner.consume(token_id).await
        }
        async fn relink(
            &self,
            token_id: &str,
            expected: Option<&str>,
            sibling: &str,
        ) -> Result<bool, StoreError> {
            self.inner.relink(token_id, expected, sibling).await
        }
        async fn is_revoked(&self, token_id: &str) -> Result<bool, StoreError> {
            self.inner.is_revoked(token_id).await
        }
        async fn revoke_identity(&self, identity_id: Uuid) -> Result<usize, StoreError> {
            self.inner.revoke_identity(identity_id).await
        }
        async fn sweep(&self) -> Result<usize, StoreError> {
            self.inner.sweep().await
        }
        fn backend(&self) -> &'static str {
            "lock-before-access"
        }
    }

    #[tokio::test]
    async fn lock_during_login_leaves_no_live_session() {
        let sessions = Arc::new(LockBeforeAccessRecorded {
            inner: MemorySessionCache::new(Arc::new(ManualClock::new(T0)), 60),
            store: OnceLock::new(),
            recorded: Mutex::new(Vec::new()),
        });
        let h = harness_with(TokenPolicy::default(), Some(sessions.clone()));
        signup(&h).await;
        assert!(sessions.store.set(h.store.clone()).is_ok());

        assert_eq!(
            h.engine
                .login("alice@example.com", PASSWORD)
                .await
                .unwrap_err(),
            AuthError::AuthenticationFailed
        );
        let recorded = sessions.recorded.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        for token_id in &recorded {
            assert!(sessions.inner.is_revoked(token_id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn stalled_cache_surfaces_as_unavailable() {
        let h = harness_with(
            TokenPolicy {
                backend_timeout: Duration::from_millis(20),
                ..TokenPolicy::default()
            },
            Some(Arc::new(StalledSessions)),
        );
        signup(&h).await;
        let err = h
            .engine
            .login("alice@example.com", PASSWORD)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));
        assert!(err.is_retryable());
    }
}

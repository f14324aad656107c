//! Auth 服务共享状态：鉴权引擎与接口级开关。

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    auth::{
        clock::{Clock, SystemClock},
        credentials::{CredentialStore, MemoryCredentialStore, PgCredentialStore},
        engine::AuthEngine,
        password::CredentialHasher,
        session::{MemorySessionCache, RedisSessionCache, SessionCache},
        token::TokenCodec,
    },
    config::Config,
};

/// 路由共享状态。
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: Arc<AuthEngine>,
    /// 写 cookie 时是否附加 `Secure`。
    pub(crate) cookie_secure: bool,
}

impl AppState {
    /// 按配置装配后端；未配置连接串时退回进程内存实现。
    pub(crate) async fn build(config: &Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let codec = TokenCodec::new(
            config.key_ring()?,
            clock.clone(),
            config.clock_leeway_sec,
            config.issuer.clone(),
        );

        let sessions: Arc<dyn SessionCache> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisSessionCache::connect(url, clock.clone(), config.session_grace_sec)
                    .await
                    .context("connect redis session cache")?,
            ),
            None => {
                warn!("AUTH_REDIS_URL not set, sessions are kept in process memory");
                Arc::new(MemorySessionCache::new(
                    clock.clone(),
                    config.session_grace_sec,
                ))
            }
        };

        let credentials: Arc<dyn CredentialStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgCredentialStore::connect(
                    url,
                    config.db_max_connections,
                    config.policy.backend_timeout,
                )
                .await
                .context("connect postgres credential store")?,
            ),
            None => {
                warn!("AUTH_DATABASE_URL not set, identities are kept in process memory");
                Arc::new(MemoryCredentialStore::new())
            }
        };

        let hasher = CredentialHasher::new(config.hash_params, config.hash_limits)
            .context("init credential hasher")?;
        let engine = AuthEngine::new(codec, sessions, credentials, hasher, clock, config.policy);
        let (credential_backend, session_backend) = engine.backends();
        info!(
            "auth engine ready: credentials={credential_backend} sessions={session_backend} alg={}",
            config.signing.alg()
        );
        Ok(Self {
            engine: Arc::new(engine),
            cookie_secure: config.cookie_secure,
        })
    }

    /// 纯内存状态，口令哈希使用最低成本参数。
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use std::time::Duration;

        use crate::auth::{
            engine::TokenPolicy,
            keys::{Algorithm, KeyEntry, KeyRing},
            password::{HashLimits, HashParams},
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let key = KeyEntry::hmac(
            Some("test"),
            Algorithm::Hs256,
            b"state-test-secret-state-test-secret",
        )
        .unwrap();
        let codec = TokenCodec::new(
            KeyRing::new(key, vec![Algorithm::Hs256]).unwrap(),
            clock.clone(),
            5,
            "auth-service",
        );
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
        let engine = AuthEngine::new(
            codec,
            Arc::new(MemorySessionCache::new(clock.clone(), 60)),
            Arc::new(MemoryCredentialStore::new()),
            hasher,
            clock,
            TokenPolicy::default(),
        );
        Self {
            engine: Arc::new(engine),
            cookie_secure: false,
        }
    }
}

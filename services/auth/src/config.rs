//! 配置模块职责：
//! 1. 读取 `AUTH_*` 环境变量，并叠加可选的 JSON 配置文件（仅非敏感项）。
//! 2. 校验令牌时效、时钟容差与会话保留期之间的约束。
//! 3. 构建签名密钥环，输出脱敏后的配置摘要供 `doctor` 使用。

use std::{fmt, fs, path::PathBuf, time::Duration};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::auth::{
    engine::TokenPolicy,
    keys::{Algorithm, KeyEntry, KeyRing, generate_key_material},
    password::{HashLimits, HashParams},
};

/// 配置文件路径环境变量。
const CONFIG_PATH_ENV: &str = "AUTH_CONFIG_PATH";
const DEFAULT_ADDR: &str = "0.0.0.0:18090";
const DEFAULT_ISSUER: &str = "auth-service";
const DEFAULT_ACCESS_TTL_SEC: u64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SEC: u64 = 14 * 24 * 60 * 60;
const DEFAULT_CLOCK_LEEWAY_SEC: u64 = 30;
const DEFAULT_SESSION_GRACE_SEC: u64 = 60;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 2000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_SWEEP_INTERVAL_SEC: u64 = 300;

/// 持久化配置（仅存可覆盖项，不存密钥与连接串）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct PersistedConfig {
    pub(crate) addr: Option<String>,
    pub(crate) issuer: Option<String>,
    pub(crate) jwt_alg: Option<String>,
    pub(crate) jwt_kid: Option<String>,
    pub(crate) jwt_allowed_algs: Option<Vec<String>>,
    pub(crate) access_ttl_sec: Option<u64>,
    pub(crate) refresh_ttl_sec: Option<u64>,
    pub(crate) clock_leeway_sec: Option<u64>,
    pub(crate) rotate_refresh: Option<bool>,
    pub(crate) session_grace_sec: Option<u64>,
    pub(crate) db_max_connections: Option<u32>,
    pub(crate) backend_timeout_ms: Option<u64>,
    pub(crate) hash_max_concurrency: Option<usize>,
    pub(crate) hash_max_queue: Option<usize>,
    pub(crate) hash_queue_timeout_ms: Option<u64>,
    pub(crate) argon2_memory_kib: Option<u32>,
    pub(crate) argon2_iterations: Option<u32>,
    pub(crate) argon2_parallelism: Option<u32>,
    pub(crate) sweep_interval_sec: Option<u64>,
    pub(crate) cookie_secure: Option<bool>,
}

/// 活动签名密钥来源。
#[derive(Clone)]
pub(crate) enum SigningSource {
    /// HS256 / HS512 共享密钥。
    Hmac { alg: Algorithm, secret: String },
    /// Ed25519 seed（base64url）。
    Ed25519 { seed: String },
    /// 未配置密钥：启动时随机生成，重启后已签发令牌全部失效。
    Ephemeral { alg: Algorithm },
}

impl SigningSource {
    pub(crate) fn alg(&self) -> Algorithm {
        match self {
            Self::Hmac { alg, .. } | Self::Ephemeral { alg } => *alg,
            Self::Ed25519 { .. } => Algorithm::EdDsa,
        }
    }
}

impl fmt::Debug for SigningSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hmac { alg, .. } => write!(f, "Hmac({alg}, <redacted>)"),
            Self::Ed25519 { .. } => write!(f, "Ed25519(<redacted>)"),
            Self::Ephemeral { alg } => write!(f, "Ephemeral({alg})"),
        }
    }
}

/// Auth 服务运行时配置。
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// HTTP 监听地址。
    pub(crate) addr: String,
    /// 令牌 `iss`。
    pub(crate) issuer: String,
    pub(crate) signing: SigningSource,
    pub(crate) signing_kid: Option<String>,
    /// 轮换窗口内仍可验签的旧密钥（`kid:ALG:material`）。
    pub(crate) verify_keys: Vec<String>,
    pub(crate) allowed_algs: Vec<Algorithm>,
    pub(crate) policy: TokenPolicy,
    pub(crate) clock_leeway_sec: u64,
    /// 会话记录在令牌过期后的额外保留时间。
    pub(crate) session_grace_sec: u64,
    pub(crate) redis_url: Option<String>,
    pub(crate) database_url: Option<String>,
    pub(crate) db_max_connections: u32,
    pub(crate) hash_params: HashParams,
    pub(crate) hash_limits: HashLimits,
    pub(crate) sweep_interval: Duration,
    /// cookie 是否附加 `Secure`。
    pub(crate) cookie_secure: bool,
}

impl Config {
    /// 从进程环境与配置文件构建配置。
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let persisted = load_persisted_config()?;
        Self::from_lookup(|key| std::env::var(key).ok(), persisted)
    }

    /// 从任意键值来源构建配置；环境优先于配置文件。
    pub(crate) fn from_lookup<F>(lookup: F, persisted: PersistedConfig) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let alg_raw = env
            .string("AUTH_JWT_ALG")
            .or(persisted.jwt_alg.clone())
            .unwrap_or_else(|| Algorithm::Hs256.as_str().to_string());
        let alg = Algorithm::from_config(&alg_raw)
            .ok_or_else(|| anyhow!("unsupported AUTH_JWT_ALG: {alg_raw}"))?;
        let signing = match alg {
            Algorithm::EdDsa => match env.string("AUTH_JWT_ED25519_SEED") {
                Some(seed) => SigningSource::Ed25519 { seed },
                None => SigningSource::Ephemeral { alg },
            },
            _ => match env.string("AUTH_JWT_SECRET") {
                Some(secret) => SigningSource::Hmac { alg, secret },
                None => SigningSource::Ephemeral { alg },
            },
        };

        let verify_keys = env.csv("AUTH_JWT_VERIFY_KEYS").unwrap_or_default();
        let allowed_algs = match env
            .csv("AUTH_JWT_ALLOWED_ALGS")
            .or(persisted.jwt_allowed_algs.clone())
        {
            Some(list) => list
                .iter()
                .map(|raw| {
                    Algorithm::from_config(raw)
                        .ok_or_else(|| anyhow!("unsupported algorithm in AUTH_JWT_ALLOWED_ALGS: {raw}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => default_allowed_algs(alg, &verify_keys),
        };

        let access_ttl_sec = env
            .u64("AUTH_ACCESS_TTL_SEC")?
            .or(persisted.access_ttl_sec)
            .unwrap_or(DEFAULT_ACCESS_TTL_SEC);
        let refresh_ttl_sec = env
            .u64("AUTH_REFRESH_TTL_SEC")?
            .or(persisted.refresh_ttl_sec)
            .unwrap_or(DEFAULT_REFRESH_TTL_SEC);
        let clock_leeway_sec = env
            .u64("AUTH_CLOCK_LEEWAY_SEC")?
            .or(persisted.clock_leeway_sec)
            .unwrap_or(DEFAULT_CLOCK_LEEWAY_SEC);
        let session_grace_sec = env
            .u64("AUTH_SESSION_GRACE_SEC")?
            .or(persisted.session_grace_sec)
            .unwrap_or(DEFAULT_SESSION_GRACE_SEC);
        let backend_timeout_ms = env
            .u64("AUTH_BACKEND_TIMEOUT_MS")?
            .or(persisted.backend_timeout_ms)
            .unwrap_or(DEFAULT_BACKEND_TIMEOUT_MS);

        let default_params = HashParams::default();
        let hash_params = HashParams {
            memory_kib: env
                .u32("AUTH_ARGON2_MEMORY_KIB")?
                .or(persisted.argon2_memory_kib)
                .unwrap_or(default_params.memory_kib),
            iterations: env
                .u32("AUTH_ARGON2_ITERATIONS")?
                .or(persisted.argon2_iterations)
                .unwrap_or(default_params.iterations),
            parallelism: env
                .u32("AUTH_ARGON2_PARALLELISM")?
                .or(persisted.argon2_parallelism)
                .unwrap_or(default_params.parallelism),
        };
        let default_limits = HashLimits::default();
        let hash_limits = HashLimits {
            max_concurrency: env
                .usize("AUTH_HASH_MAX_CONCURRENCY")?
                .or(persisted.hash_max_concurrency)
                .unwrap_or(default_limits.max_concurrency),
            max_queue: env
                .usize("AUTH_HASH_MAX_QUEUE")?
                .or(persisted.hash_max_queue)
                .unwrap_or(default_limits.max_queue),
            queue_timeout: env
                .u64("AUTH_HASH_QUEUE_TIMEOUT_MS")?
                .or(persisted.hash_queue_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(default_limits.queue_timeout),
        };

        let config = Self {
            addr: env
                .string("AUTH_ADDR")
                .or(persisted.addr.clone())
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            issuer: env
                .string("AUTH_ISSUER")
                .or(persisted.issuer.clone())
                .unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
            signing,
            signing_kid: env.string("AUTH_JWT_KID").or(persisted.jwt_kid.clone()),
            verify_keys,
            allowed_algs,
            policy: TokenPolicy {
                access_ttl_sec,
                refresh_ttl_sec,
                rotate_refresh: env
                    .bool("AUTH_ROTATE_REFRESH")?
                    .or(persisted.rotate_refresh)
                    .unwrap_or(true),
                backend_timeout: Duration::from_millis(backend_timeout_ms),
            },
            clock_leeway_sec,
            session_grace_sec,
            redis_url: env.string("AUTH_REDIS_URL"),
            database_url: env.string("AUTH_DATABASE_URL"),
            db_max_connections: env
                .u32("AUTH_DB_MAX_CONNECTIONS")?
                .or(persisted.db_max_connections)
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
            hash_params,
            hash_limits,
            sweep_interval: Duration::from_secs(
                env.u64("AUTH_SWEEP_INTERVAL_SEC")?
                    .or(persisted.sweep_interval_sec)
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SEC),
            ),
            cookie_secure: env
                .bool("AUTH_COOKIE_SECURE")?
                .or(persisted.cookie_secure)
                .unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.issuer.trim().is_empty() {
            bail!("AUTH_ISSUER must not be empty");
        }
        if self.policy.access_ttl_sec == 0 {
            bail!("AUTH_ACCESS_TTL_SEC must be positive");
        }
        if self.policy.refresh_ttl_sec <= self.policy.access_ttl_sec {
            bail!("AUTH_REFRESH_TTL_SEC must be longer than AUTH_ACCESS_TTL_SEC");
        }
        // 会话记录必须活得比容差窗口内的令牌久，否则合法令牌会被判为已吊销。
        if self.session_grace_sec < self.clock_leeway_sec {
            bail!("AUTH_SESSION_GRACE_SEC must be >= AUTH_CLOCK_LEEWAY_SEC");
        }
        if self.policy.backend_timeout.is_zero() {
            bail!("AUTH_BACKEND_TIMEOUT_MS must be positive");
        }
        if self.hash_limits.max_concurrency == 0 {
            bail!("AUTH_HASH_MAX_CONCURRENCY must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("AUTH_SWEEP_INTERVAL_SEC must be positive");
        }
        if self.allowed_algs.is_empty() {
            bail!("AUTH_JWT_ALLOWED_ALGS must not be empty");
        }
        Ok(())
    }

    /// 构建密钥环：活动签名密钥 + 轮换验签密钥。
    pub(crate) fn key_ring(&self) -> anyhow::Result<KeyRing> {
        let kid = self.signing_kid.as_deref();
        let active = match &self.signing {
            SigningSource::Hmac { alg, secret } => KeyEntry::hmac(kid, *alg, secret.as_bytes())
                .context("invalid AUTH_JWT_SECRET")?,
            SigningSource::Ed25519 { seed } => {
                KeyEntry::ed25519_signing(kid, seed).context("invalid AUTH_JWT_ED25519_SEED")?
            }
            SigningSource::Ephemeral { alg } => {
                warn!(
                    "no signing key configured, generated an ephemeral {alg} key; tokens will not survive restart"
                );
                let material = generate_key_material(*alg);
                match alg {
                    Algorithm::EdDsa => KeyEntry::ed25519_signing(kid, &material)?,
                    _ => KeyEntry::hmac(kid, *alg, material.as_bytes())?,
                }
            }
        };
        let mut ring = KeyRing::new(active, self.allowed_algs.clone())
            .context("active signing key rejected")?;
        for descriptor in &self.verify_keys {
            let entry = KeyEntry::parse_descriptor(descriptor)
                .context("invalid AUTH_JWT_VERIFY_KEYS entry")?;
            ring = ring.with_key(entry)?;
        }
        Ok(ring)
    }

    /// 脱敏配置摘要。
    pub(crate) fn summary(&self) -> Value {
        let signing = match &self.signing {
            SigningSource::Ephemeral { .. } => "ephemeral",
            _ => "configured",
        };
        json!({
            "addr": self.addr,
            "issuer": self.issuer,
            "jwtAlg": self.signing.alg().as_str(),
            "signingKey": signing,
            "signingKid": self.signing_kid,
            "verifyKeys": self.verify_keys.len(),
            "allowedAlgs": self.allowed_algs.iter().map(|alg| alg.as_str()).collect::<Vec<_>>(),
            "accessTtlSec": self.policy.access_ttl_sec,
            "refreshTtlSec": self.policy.refresh_ttl_sec,
            "rotateRefresh": self.policy.rotate_refresh,
            "clockLeewaySec": self.clock_leeway_sec,
            "sessionGraceSec": self.session_grace_sec,
            "backendTimeoutMs": self.policy.backend_timeout.as_millis() as u64,
            "redisUrl": self.redis_url.as_deref().map(redact_url),
            "databaseUrl": self.database_url.as_deref().map(redact_url),
            "dbMaxConnections": self.db_max_connections,
            "argon2": {
                "memoryKib": self.hash_params.memory_kib,
                "iterations": self.hash_params.iterations,
                "parallelism": self.hash_params.parallelism,
            },
            "hashMaxConcurrency": self.hash_limits.max_concurrency,
            "hashMaxQueue": self.hash_limits.max_queue,
            "hashQueueTimeoutMs": self.hash_limits.queue_timeout.as_millis() as u64,
            "sweepIntervalSec": self.sweep_interval.as_secs(),
            "cookieSecure": self.cookie_secure,
        })
    }
}

/// 读取配置文件；未设置路径或文件不存在时返回默认值。
pub(crate) fn load_persisted_config() -> anyhow::Result<PersistedConfig> {
    let Some(path) = config_file_path() else {
        return Ok(PersistedConfig::default());
    };
    if !path.exists() {
        return Ok(PersistedConfig::default());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read auth config failed: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("decode auth config failed: {}", path.display()))
}

fn config_file_path() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

/// 未显式配置白名单时：活动算法 + 轮换密钥声明的算法。
fn default_allowed_algs(active: Algorithm, verify_keys: &[String]) -> Vec<Algorithm> {
    let mut algs = vec![active];
    for descriptor in verify_keys {
        if let Some(alg) = descriptor.split(':').nth(1).and_then(Algorithm::from_config)
            && !algs.contains(&alg)
        {
            algs.push(alg);
        }
    }
    algs
}

/// 隐藏连接串中的用户信息。
fn redact_url(raw: &str) -> String {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => raw.to_string(),
    }
}

/// 键值读取辅助：空白值视为未设置，非法值报错。
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|raw| raw.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn csv(&self, key: &str) -> Option<Vec<String>> {
        self.string(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }

    fn u64(&self, key: &str) -> anyhow::Result<Option<u64>> {
        self.string(key)
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("{key} must be an unsigned integer, got `{raw}`"))
            })
            .transpose()
    }

    fn u32(&self, key: &str) -> anyhow::Result<Option<u32>> {
        self.u64(key)?
            .map(|value| u32::try_from(value).with_context(|| format!("{key} is out of range")))
            .transpose()
    }

    fn usize(&self, key: &str) -> anyhow::Result<Option<usize>> {
        self.u64(key)?
            .map(|value| usize::try_from(value).with_context(|| format!("{key} is out of range")))
            .transpose()
    }

    fn bool(&self, key: &str) -> anyhow::Result<Option<bool>> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "n" | "off" => Ok(Some(false)),
            _ => bail!("{key} must be a boolean, got `{raw}`"),
        }
    }
}

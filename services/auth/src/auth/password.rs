//! 口令哈希：Argon2id 计算放在阻塞线程池，并发与排队都有上限。

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use argon2::{
    Algorithm as Argon2Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier,
    Version, password_hash::SaltString,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::auth::credentials::HashAlg;

/// Argon2id 成本参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashParams {
    pub(crate) memory_kib: u32,
    pub(crate) iterations: u32,
    pub(crate) parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// 哈希任务并发上限与排队策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashLimits {
    pub(crate) max_concurrency: usize,
    pub(crate) max_queue: usize,
    pub(crate) queue_timeout: Duration,
}

impl Default for HashLimits {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(2);
        Self {
            max_concurrency: cpus,
            max_queue: cpus * 8,
            queue_timeout: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum HashError {
    /// 并发已满且排队超限或超时。
    #[error("credential hasher is saturated")]
    Busy,
    #[error("invalid argon2 params: {0}")]
    Params(String),
    #[error("hash failed: {0}")]
    Failed(String),
}

pub(crate) struct CredentialHasher {
    argon: Argon2<'static>,
    params: HashParams,
    limits: HashLimits,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    /// 未知用户登录时用于对齐耗时的哈希。
    dummy_hash: Arc<str>,
    verified: AtomicU64,
}

impl CredentialHasher {
    pub(crate) fn new(params: HashParams, limits: HashLimits) -> Result<Self, HashError> {
        let argon = build_argon(params)?;
        let mut filler = [0u8; 24];
        rand::rng().fill_bytes(&mut filler);
        let dummy_hash = hash_with(&argon, &URL_SAFE_NO_PAD.encode(filler))?;
        Ok(Self {
            argon,
            params,
            limits,
            permits: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
            waiting: AtomicUsize::new(0),
            dummy_hash: dummy_hash.into(),
            verified: AtomicU64::new(0),
        })
    }

    /// 计算新的 Argon2id 哈希（PHC 字符串）。
    pub(crate) async fn hash(&self, password: &str) -> Result<String, HashError> {
        let argon = self.argon.clone();
        let password = password.to_string();
        self.run(move || hash_with(&argon, &password)).await?
    }

    /// 按算法标记校验口令；哈希串损坏时返回 false。
    pub(crate) async fn verify(
        &self,
        hash: &str,
        alg: HashAlg,
        password: &str,
    ) -> Result<bool, HashError> {
        let argon = self.argon.clone();
        let hash = hash.to_string();
        let password = password.to_string();
        let matched = self
            .run(move || match alg {
                HashAlg::Argon2id => verify_argon(&argon, &hash, &password),
                HashAlg::Bcrypt => bcrypt::verify(&password, &hash).unwrap_or(false),
            })
            .await?;
        self.verified.fetch_add(1, Ordering::Relaxed);
        Ok(matched)
    }

    /// 以相同成本校验一次占位哈希，结果丢弃。
    pub(crate) async fn verify_dummy(&self, password: &str) -> Result<(), HashError> {
        let dummy = self.dummy_hash.to_string();
        self.verify(&dummy, HashAlg::Argon2id, password)
            .await
            .map(|_| ())
    }

    /// 旧算法或成本参数与当前配置不一致时需要重新哈希。
    pub(crate) fn needs_rehash(&self, hash: &str, alg: HashAlg) -> bool {
        if alg != HashAlg::Argon2id {
            return true;
        }
        let Ok(parsed) = PasswordHash::new(hash) else {
            return true;
        };
        if parsed.algorithm != Argon2Algorithm::Argon2id.ident() {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(current) => {
                current.m_cost() != self.params.memory_kib
                    || current.t_cost() != self.params.iterations
                    || current.p_cost() != self.params.parallelism
            }
            Err(_) => true,
        }
    }

    #[cfg(test)]
    pub(crate) fn verified_count(&self) -> u64 {
        self.verified.load(Ordering::Relaxed)
    }

    async fn run<T, F>(&self, job: F) -> Result<T, HashError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = self.acquire().await?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| HashError::Failed(format!("hash worker failed: {err}")))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, HashError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        let Some(_slot) = QueueSlot::take(&self.waiting, self.limits.max_queue) else {
            warn!("credential hasher queue full, rejecting");
            return Err(HashError::Busy);
        };
        let acquired = tokio::time::timeout(
            self.limits.queue_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await;
        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(HashError::Failed("hasher closed".to_string())),
            Err(_) => {
                warn!(
                    "credential hasher queue wait exceeded {}ms",
                    self.limits.queue_timeout.as_millis()
                );
                Err(HashError::Busy)
            }
        }
    }
}

/// 排队名额；请求被取消时随 future 一起释放。
struct QueueSlot<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    fn take(waiting: &'a AtomicUsize, max_queue: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max_queue).then_some(current + 1)
            })
            .ok()
            .map(|_| Self { waiting })
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 同步计算哈希，供 CLI 使用。
pub(crate) fn hash_password_blocking(
    params: HashParams,
    password: &str,
) -> Result<String, HashError> {
    hash_with(&build_argon(params)?, password)
}

fn build_argon(params: HashParams) -> Result<Argon2<'static>, HashError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        None,
    )
    .map_err(|err| HashError::Params(err.to_string()))?;
    Ok(Argon2::new(Argon2Algorithm::Argon2id, Version::V0x13, params))
}

fn hash_with(argon: &Argon2<'_>, password: &str) -> Result<String, HashError> {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|err| HashError::Failed(err.to_string()))?;
    argon
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| HashError::Failed(err.to_string()))
}

fn verify_argon(argon: &Argon2<'_>, hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => argon.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

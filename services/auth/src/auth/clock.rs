//! 服务端时钟：令牌签发、过期判定与会话清理共用。

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};

/// 当前 unix 秒。
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// 秒级时钟抽象。
pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// 系统墙钟。
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        unix_now()
    }
}

/// 测试用手动时钟，只能前进。
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// 前进指定秒数。
    pub(crate) fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

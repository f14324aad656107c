//! 鉴权领域：令牌编解码、会话吊销缓存、凭据存储与鉴权引擎。

pub(crate) mod clock;
pub(crate) mod credentials;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod handlers;
pub(crate) mod keys;
pub(crate) mod password;
pub(crate) mod session;
pub(crate) mod token;

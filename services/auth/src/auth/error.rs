//! 鉴权错误分类与 HTTP 映射。

use axum::http::StatusCode;

use crate::{
    api::error::ApiError,
    auth::{password::HashError, token::TokenError},
};

/// 引擎对外暴露的错误分类。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum AuthError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid token signature: {0}")]
    InvalidSignature(String),
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    /// 用户不存在与密码错误合并为同一错误。
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("account locked or disabled")]
    AccountLocked,
    /// 存储或缓存超时/故障，调用方可退避重试。
    #[error("dependency unavailable: {0}")]
    Unavailable(String),
    #[error("too many concurrent credential checks")]
    RateLimited,
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("username already registered")]
    Conflict,
    #[error("identity not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// 是否允许调用方重试。
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited)
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed(detail) => Self::Malformed(detail),
            TokenError::InvalidSignature(detail) => Self::InvalidSignature(detail),
            TokenError::Expired => Self::Expired,
            TokenError::Signing(detail) => Self::Internal(detail),
        }
    }
}

impl From<HashError> for AuthError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Busy => Self::RateLimited,
            HashError::Params(detail) | HashError::Failed(detail) => Self::Internal(detail),
        }
    }
}

/// 存储层（凭证库 / 会话缓存）错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("duplicate record")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Backend(detail) => Self::Unavailable(detail),
            StoreError::Duplicate => Self::Conflict,
            StoreError::NotFound => Self::NotFound,
            StoreError::Corrupt(detail) => Self::Internal(detail),
        }
    }
}

/// 鉴权错误映射到 API 错误：令牌与凭证类失败统一为同一条提示，仅过期单独标注。
impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Expired => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "TOKEN_EXPIRED",
                "认证失败",
                "请刷新凭证或重新登录",
            ),
            AuthError::Malformed(_)
            | AuthError::InvalidSignature(_)
            | AuthError::Revoked
            | AuthError::AuthenticationFailed
            | AuthError::AccountLocked => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                "认证失败",
                "请重新登录",
            ),
            AuthError::Unavailable(_) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "服务暂不可用",
                "请稍后重试",
            )
            .with_retry_after(1),
            AuthError::RateLimited => ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "请求过于频繁",
                "请稍后重试",
            )
            .with_retry_after(1),
            AuthError::InvalidRequest(detail) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                detail,
                "请检查输入后重试",
            ),
            AuthError::Conflict => ApiError::new(
                StatusCode::CONFLICT,
                "EMAIL_TAKEN",
                "邮箱已注册",
                "请直接登录或更换邮箱",
            ),
            AuthError::NotFound => ApiError::new(
                StatusCode::NOT_FOUND,
                "USER_NOT_FOUND",
                "用户不存在",
                "请重新登录",
            ),
            AuthError::Internal(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "服务内部错误",
                "请稍后重试",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::{AuthError, StoreError};
    use crate::api::error::ApiError;

    #[test]
    fn credential_and_token_failures_share_one_message() {
        let failures = [
            AuthError::Malformed("x".to_string()),
            AuthError::InvalidSignature("x".to_string()),
            AuthError::Revoked,
            AuthError::AuthenticationFailed,
            AuthError::AccountLocked,
        ];
        for err in failures {
            let api = ApiError::from(err);
            assert_eq!(api.status, StatusCode::UNAUTHORIZED);
            assert_eq!(api.code, "UNAUTHENTICATED");
            assert_eq!(api.message, "认证失败");
        }
    }

    #[test]
    fn backend_failures_are_retryable() {
        let err = AuthError::from(StoreError::Backend("redis down".to_string()));
        assert!(err.is_retryable());
        assert!(AuthError::RateLimited.is_retryable());
        assert!(!AuthError::Revoked.is_retryable());

        let api = ApiError::from(err);
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.retry_after, Some(1));
    }
}

//! 内部鉴权类型到协议载荷的转换，以及接口常量。

use auth_shared_protocol::{TokenPairPayload, UserPayload, ValidatePayload};
use chrono::SecondsFormat;

use crate::auth::{
    credentials::Identity,
    engine::IssuedTokens,
    error::AuthError,
    token::Claims,
};

/// 登录/刷新时写入的 access token cookie 名。
pub(crate) const ACCESS_COOKIE: &str = "token";
/// 校验成功后回写给网关的身份头。
pub(crate) const USER_ID_HEADER: &str = "x-user-id";

pub(crate) fn user_payload(identity: &Identity) -> UserPayload {
    UserPayload {
        id: identity.id,
        email: identity.username.clone(),
        nickname: identity.nickname.clone(),
        role: identity.role.as_str().to_string(),
        status: identity.status.as_str().to_string(),
        created_at: identity
            .created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// 令牌对载荷；剩余秒数按签发时间计算。
pub(crate) fn token_pair_payload(issued: &IssuedTokens) -> TokenPairPayload {
    TokenPairPayload {
        access_token: issued.access_token.clone(),
        refresh_token: issued.refresh_token.clone(),
        token_type: "Bearer".to_string(),
        expires_in: issued
            .access_claims
            .exp
            .saturating_sub(issued.access_claims.iat),
        refresh_expires_in: issued
            .refresh_claims
            .exp
            .saturating_sub(issued.access_claims.iat),
    }
}

pub(crate) fn validate_payload(claims: &Claims) -> Result<ValidatePayload, AuthError> {
    Ok(ValidatePayload {
        user_id: claims.identity_id()?,
        email: claims.email.clone(),
        role: claims.role.clone(),
        token_id: claims.jti.clone(),
        expires_at: claims.exp,
        ext: claims.ext.clone(),
    })
}

/// 构造 access token cookie。
pub(crate) fn access_cookie(token: &str, max_age_sec: u64, secure: bool) -> String {
    let mut cookie =
        format!("{ACCESS_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_sec}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// 清除 access token cookie。
pub(crate) fn cleared_cookie(secure: bool) -> String {
    access_cookie("", 0, secure)
}

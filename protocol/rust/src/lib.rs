// 文件职责：
// 1) 定义 auth-service 与调用方共用的 HTTP 协议数据结构。
// 2) 提供用户名归一化等跨端一致的基础函数。
// 3) 作为 Rust 侧协议唯一代码源，供服务端与测试复用。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 注册请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    // 登录邮箱（服务端会归一化）。
    pub email: String,
    // 明文密码（至少 8 个字符）。
    pub password: String,
    // 展示昵称。
    pub nickname: String,
}

/// 登录请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(alias = "email")]
    // 用户名（即归一化前的邮箱）。
    pub username: String,
    // 明文密码。
    pub password: String,
}

/// 刷新请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    // 待兑换的 refresh token。
    pub refresh_token: String,
}

/// 登出请求：access 或 refresh 任一均可。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub token: String,
}

/// 修改口令请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// 管理员修改账号状态请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStatusRequest {
    // `ACTIVE` / `LOCKED` / `DISABLED`。
    pub status: String,
}

/// 吊销结果。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevokedSessionsPayload {
    pub revoked_sessions: usize,
}

/// 令牌对响应。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPairPayload {
    // 短时 access token。
    pub access_token: String,
    // 长时 refresh token。
    pub refresh_token: String,
    // 固定为 `Bearer`。
    pub token_type: String,
    // access token 剩余秒数。
    pub expires_in: u64,
    // refresh token 剩余秒数。
    pub refresh_expires_in: u64,
}

/// 校验成功后返回给下游鉴权的 claims 摘要。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePayload {
    // 身份 ID。
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    // 登录邮箱（可选）。
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    // 角色（可选）。
    pub role: Option<String>,
    // 令牌 ID（jti）。
    pub token_id: String,
    // 过期时间（unix 秒）。
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    // 扩展 claims。
    pub ext: BTreeMap<String, Value>,
}

/// 用户资料响应。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub id: Uuid,
    pub email: String,
    pub nickname: String,
    pub role: String,
    pub status: String,
    pub created_at: String,
}

/// 归一化用户名：去掉首尾空白并转小写，注册与登录共用同一规则。
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{LoginRequest, TokenPairPayload, normalize_username};

    #[test]
    fn username_is_trimmed_and_lowercased() {
        assert_eq!(normalize_username("  Alice@Example.COM "), "alice@example.com");
        assert_eq!(normalize_username(""), "");
    }

    #[test]
    fn login_request_accepts_email_alias() {
        let req: LoginRequest =
            serde_json::from_str(r#"{"email":"a@b.c","password":"pw"}"#).unwrap();
        assert_eq!(req.username, "a@b.c");
    }

    #[test]
    fn token_pair_uses_camel_case_fields() {
        let payload = TokenPairPayload {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 900,
            refresh_expires_in: 3600,
        };
        let raw = serde_json::to_string(&payload).unwrap();
        assert!(raw.contains("\"accessToken\""));
        assert!(raw.contains("\"refreshExpiresIn\""));
    }
}

//! 令牌编解码：claims ⇄ `header.payload.signature`（标准 JWS 紧凑格式）。

use std::{collections::BTreeMap, sync::Arc};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::{
    clock::Clock,
    keys::{Algorithm, KeyRing},
};

/// 令牌最大长度，超出直接视为格式错误。
const MAX_TOKEN_LEN: usize = 8 * 1024;
/// 扩展 claims 条目上限。
const MAX_EXT_ENTRIES: usize = 16;
/// 扩展 claims key 最大长度。
const MAX_EXT_KEY_LEN: usize = 64;
/// 扩展 claims 字符串值最大长度。
const MAX_EXT_STRING_LEN: usize = 256;
/// 扩展 map 中禁止出现的标准字段名。
const RESERVED_CLAIMS: [&str; 10] = [
    "sub", "iss", "aud", "iat", "exp", "nbf", "jti", "token_type", "email", "role",
];

/// 令牌类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

/// 令牌 claims：固定字段 + 显式扩展 map，解码时拒绝未知字段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Claims {
    pub(crate) sub: String,
    pub(crate) iss: String,
    pub(crate) iat: u64,
    pub(crate) exp: u64,
    pub(crate) jti: String,
    pub(crate) token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) ext: BTreeMap<String, Value>,
}

impl Claims {
    /// 解析 subject 为身份 ID。
    pub(crate) fn identity_id(&self) -> Result<Uuid, TokenError> {
        Uuid::parse_str(&self.sub).map_err(|_| TokenError::Malformed("sub is not a uuid".into()))
    }
}

/// JWS header。
#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// 编解码错误；detail 仅写日志，不回给调用方。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("token expired")]
    Expired,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// 令牌编解码器：密钥环启动时装载后只读。
pub(crate) struct TokenCodec {
    keys: KeyRing,
    clock: Arc<dyn Clock>,
    leeway_sec: u64,
    issuer: String,
}

impl TokenCodec {
    pub(crate) fn new(
        keys: KeyRing,
        clock: Arc<dyn Clock>,
        leeway_sec: u64,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            keys,
            clock,
            leeway_sec,
            issuer: issuer.into(),
        }
    }

    pub(crate) fn issuer(&self) -> &str {
        &self.issuer
    }

    /// 用活动密钥签发令牌。
    pub(crate) fn issue(&self, claims: &Claims) -> Result<String, TokenError> {
        validate_claims(claims, &self.issuer, None)?;
        let key = self.keys.active();
        let header = TokenHeader {
            alg: key.alg().as_str().to_string(),
            typ: Some("JWT".to_string()),
            kid: Some(key.kid().to_string()),
        };
        let header_raw = serde_json::to_vec(&header)
            .map_err(|err| TokenError::Signing(format!("encode header failed: {err}")))?;
        let payload_raw = serde_json::to_vec(claims)
            .map_err(|err| TokenError::Signing(format!("encode claims failed: {err}")))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_raw),
            URL_SAFE_NO_PAD.encode(payload_raw)
        );
        let signature = key
            .sign(signing_input.as_bytes())
            .ok_or_else(|| TokenError::Signing(format!("key {} cannot sign", key.kid())))?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// 校验签名、结构与过期时间。
    pub(crate) fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode(token, true)
    }

    /// 只校验签名与结构，忽略过期；登出时用于定位已过期令牌的配对令牌。
    pub(crate) fn verify_ignoring_expiry(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode(token, false)
    }

    fn decode(&self, token: &str, enforce_expiry: bool) -> Result<Claims, TokenError> {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(TokenError::Malformed("token length out of range".into()));
        }

        let mut parts = token.split('.');
        let header_b64 = parts.next().unwrap_or_default();
        let payload_b64 = parts.next().unwrap_or_default();
        let sig_b64 = parts.next().unwrap_or_default();
        if header_b64.is_empty()
            || payload_b64.is_empty()
            || sig_b64.is_empty()
            || parts.next().is_some()
        {
            return Err(TokenError::Malformed("expected three segments".into()));
        }

        let header_raw = URL_SAFE_NO_PAD
            .decode(header_b64.as_bytes())
            .map_err(|_| TokenError::Malformed("header is not base64url".into()))?;
        let header: TokenHeader = serde_json::from_slice(&header_raw)
            .map_err(|_| TokenError::Malformed("header is not valid json".into()))?;

        let Some(alg) = Algorithm::from_header(&header.alg) else {
            return Err(TokenError::InvalidSignature(format!(
                "algorithm `{}` not supported",
                header.alg
            )));
        };
        if !self.keys.is_allowed(alg) {
            return Err(TokenError::InvalidSignature(format!(
                "algorithm {alg} not allowed"
            )));
        }
        let Some(key) = self.keys.resolve(header.kid.as_deref()) else {
            return Err(TokenError::InvalidSignature("unknown key id".into()));
        };
        // 密钥只接受其绑定的算法，防止 HS/EdDSA 混淆。
        if key.alg() != alg {
            return Err(TokenError::InvalidSignature(format!(
                "algorithm {alg} does not match key {}",
                key.kid()
            )));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64.as_bytes())
            .map_err(|_| TokenError::Malformed("signature is not base64url".into()))?;
        let signing_input_len = header_b64.len() + 1 + payload_b64.len();
        let signing_input = &token.as_bytes()[..signing_input_len];
        if !key.verify(signing_input, &signature) {
            return Err(TokenError::InvalidSignature("signature mismatch".into()));
        }

        let payload_raw = URL_SAFE_NO_PAD
            .decode(payload_b64.as_bytes())
            .map_err(|_| TokenError::Malformed("payload is not base64url".into()))?;
        let claims: Claims = serde_json::from_slice(&payload_raw)
            .map_err(|err| TokenError::Malformed(format!("claims rejected: {err}")))?;

        let now = self.clock.now();
        validate_claims(&claims, &self.issuer, Some((now, self.leeway_sec)))?;
        if enforce_expiry && now >= claims.exp.saturating_add(self.leeway_sec) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

/// 生成令牌 ID（UUID v4，来自系统随机源）。
pub(crate) fn new_token_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 校验 claims 结构；`now` 存在时额外拒绝来自未来的 iat。
fn validate_claims(
    claims: &Claims,
    issuer: &str,
    now: Option<(u64, u64)>,
) -> Result<(), TokenError> {
    if claims.sub.trim().is_empty() {
        return Err(TokenError::Malformed("empty sub".into()));
    }
    if claims.jti.trim().is_empty() {
        return Err(TokenError::Malformed("empty jti".into()));
    }
    if claims.iss != issuer {
        return Err(TokenError::Malformed("unexpected issuer".into()));
    }
    if claims.iat > claims.exp {
        return Err(TokenError::Malformed("iat after exp".into()));
    }
    if let Some((now, leeway)) = now
        && claims.iat > now.saturating_add(leeway)
    {
        return Err(TokenError::Malformed("iat in the future".into()));
    }
    validate_ext(&claims.ext)
}

fn validate_ext(ext: &BTreeMap<String, Value>) -> Result<(), TokenError> {
    if ext.len() > MAX_EXT_ENTRIES {
        return Err(TokenError::Malformed("too many extension claims".into()));
    }
    for (key, value) in ext {
        let key_ok = !key.is_empty()
            && key.len() <= MAX_EXT_KEY_LEN
            && key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
        if !key_ok || RESERVED_CLAIMS.contains(&key.as_str()) {
            return Err(TokenError::Malformed(format!("invalid extension key `{key}`")));
        }
        let value_ok = match value {
            Value::Bool(_) | Value::Number(_) => true,
            Value::String(raw) => raw.len() <= MAX_EXT_STRING_LEN,
            Value::Null | Value::Array(_) | Value::Object(_) => false,
        };
        if !value_ok {
            return Err(TokenError::Malformed(format!(
                "extension `{key}` must be a short scalar"
            )));
        }
    }
    Ok(())
}

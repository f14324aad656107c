//! 签名密钥环：按 kid 管理签名/验签密钥，轮换窗口内允许多把密钥同时验签。

use std::{collections::HashMap, fmt};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

/// 支持的签名算法；每把密钥只绑定其中一种。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Algorithm {
    Hs256,
    Hs512,
    EdDsa,
}

impl Algorithm {
    /// JWS header 中的 `alg` 取值。
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Hs256 => "HS256",
            Self::Hs512 => "HS512",
            Self::EdDsa => "EdDSA",
        }
    }

    /// 解析 header 中的 `alg`，大小写敏感；`none` 等未知取值返回 `None`。
    pub(crate) fn from_header(raw: &str) -> Option<Self> {
        match raw {
            "HS256" => Some(Self::Hs256),
            "HS512" => Some(Self::Hs512),
            "EdDSA" => Some(Self::EdDsa),
            _ => None,
        }
    }

    /// 解析配置中的算法名，大小写不敏感。
    pub(crate) fn from_config(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hs256" => Some(Self::Hs256),
            "hs512" => Some(Self::Hs512),
            "eddsa" | "ed25519" => Some(Self::EdDsa),
            _ => None,
        }
    }

    /// HMAC 密钥最小字节数（与摘要长度一致）。
    fn min_secret_len(self) -> usize {
        match self {
            Self::Hs256 => 32,
            Self::Hs512 => 64,
            Self::EdDsa => 0,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 密钥装载错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum KeyError {
    #[error("{alg} secret must be at least {min} bytes")]
    SecretTooShort { alg: Algorithm, min: usize },
    #[error("ed25519 key must be 32 bytes of base64url")]
    InvalidEd25519,
    #[error("algorithm {0} does not match the key material")]
    AlgorithmMismatch(Algorithm),
    #[error("key {0} is verification-only and cannot sign")]
    CannotSign(String),
    #[error("algorithm {0} is not in the allow-list")]
    NotAllowed(Algorithm),
    #[error("duplicate key id: {0}")]
    DuplicateKid(String),
    #[error("invalid key descriptor `{0}`, expected <kid>:<alg>:<material>")]
    InvalidDescriptor(String),
}

enum KeyMaterial {
    Hmac(Vec<u8>),
    Ed25519Signing(SigningKey),
    Ed25519Verifying(VerifyingKey),
}

/// 单把密钥：kid + 绑定算法 + 密钥材料。
pub(crate) struct KeyEntry {
    kid: String,
    alg: Algorithm,
    material: KeyMaterial,
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

impl KeyEntry {
    /// HMAC 密钥；未给 kid 时按密钥摘要推导。
    pub(crate) fn hmac(kid: Option<&str>, alg: Algorithm, secret: &[u8]) -> Result<Self, KeyError> {
        if alg == Algorithm::EdDsa {
            return Err(KeyError::AlgorithmMismatch(alg));
        }
        let min = alg.min_secret_len();
        if secret.len() < min {
            return Err(KeyError::SecretTooShort { alg, min });
        }
        let kid = resolve_kid(kid, b"hmac", secret);
        Ok(Self {
            kid,
            alg,
            material: KeyMaterial::Hmac(secret.to_vec()),
        })
    }

    /// Ed25519 签名密钥（32 字节 seed，base64url）。
    pub(crate) fn ed25519_signing(kid: Option<&str>, seed_b64: &str) -> Result<Self, KeyError> {
        let seed = decode_32(seed_b64)?;
        let signing = SigningKey::from_bytes(&seed);
        let kid = resolve_kid(kid, b"ed25519", signing.verifying_key().as_bytes());
        Ok(Self {
            kid,
            alg: Algorithm::EdDsa,
            material: KeyMaterial::Ed25519Signing(signing),
        })
    }

    /// Ed25519 公钥（仅验签）。
    pub(crate) fn ed25519_verifying(kid: Option<&str>, public_b64: &str) -> Result<Self, KeyError> {
        let raw = decode_32(public_b64)?;
        let verifying = VerifyingKey::from_bytes(&raw).map_err(|_| KeyError::InvalidEd25519)?;
        let kid = resolve_kid(kid, b"ed25519", verifying.as_bytes());
        Ok(Self {
            kid,
            alg: Algorithm::EdDsa,
            material: KeyMaterial::Ed25519Verifying(verifying),
        })
    }

    /// 解析轮换用验签密钥：`<kid>:<alg>:<material>`，HMAC 为原始密钥，EdDSA 为公钥。
    pub(crate) fn parse_descriptor(descriptor: &str) -> Result<Self, KeyError> {
        let mut parts = descriptor.trim().splitn(3, ':');
        let kid = parts.next().unwrap_or_default().trim();
        let alg = parts.next().unwrap_or_default();
        let material = parts.next().unwrap_or_default();
        if kid.is_empty() || material.is_empty() {
            return Err(KeyError::InvalidDescriptor(redact_descriptor(descriptor)));
        }
        match Algorithm::from_config(alg) {
            Some(Algorithm::EdDsa) => Self::ed25519_verifying(Some(kid), material),
            Some(alg) => Self::hmac(Some(kid), alg, material.as_bytes()),
            None => Err(KeyError::InvalidDescriptor(redact_descriptor(descriptor))),
        }
    }

    pub(crate) fn kid(&self) -> &str {
        &self.kid
    }

    pub(crate) fn alg(&self) -> Algorithm {
        self.alg
    }

    pub(crate) fn can_sign(&self) -> bool {
        !matches!(self.material, KeyMaterial::Ed25519Verifying(_))
    }

    /// 对签名输入计算签名；仅验签密钥返回 `None`。
    pub(crate) fn sign(&self, message: &[u8]) -> Option<Vec<u8>> {
        match &self.material {
            KeyMaterial::Hmac(secret) => match self.alg {
                Algorithm::Hs256 => {
                    let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
                    mac.update(message);
                    Some(mac.finalize().into_bytes().to_vec())
                }
                Algorithm::Hs512 => {
                    let mut mac = Hmac::<Sha512>::new_from_slice(secret).ok()?;
                    mac.update(message);
                    Some(mac.finalize().into_bytes().to_vec())
                }
                Algorithm::EdDsa => None,
            },
            KeyMaterial::Ed25519Signing(key) => Some(key.sign(message).to_bytes().to_vec()),
            KeyMaterial::Ed25519Verifying(_) => None,
        }
    }

    /// 校验签名；HMAC 走常量时间比较。
    pub(crate) fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match &self.material {
            KeyMaterial::Hmac(secret) => match self.alg {
                Algorithm::Hs256 => Hmac::<Sha256>::new_from_slice(secret)
                    .map(|mut mac| {
                        mac.update(message);
                        mac.verify_slice(signature).is_ok()
                    })
                    .unwrap_or(false),
                Algorithm::Hs512 => Hmac::<Sha512>::new_from_slice(secret)
                    .map(|mut mac| {
                        mac.update(message);
                        mac.verify_slice(signature).is_ok()
                    })
                    .unwrap_or(false),
                Algorithm::EdDsa => false,
            },
            KeyMaterial::Ed25519Signing(key) => verify_ed25519(&key.verifying_key(), message, signature),
            KeyMaterial::Ed25519Verifying(key) => verify_ed25519(key, message, signature),
        }
    }

    /// Ed25519 公钥（base64url），供运维分发给其他验签方。
    pub(crate) fn public_key_b64(&self) -> Option<String> {
        match &self.material {
            KeyMaterial::Ed25519Signing(key) => {
                Some(URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()))
            }
            KeyMaterial::Ed25519Verifying(key) => Some(URL_SAFE_NO_PAD.encode(key.as_bytes())),
            KeyMaterial::Hmac(_) => None,
        }
    }
}

/// 密钥环：一把活动签名密钥 + 若干仅验签密钥 + 算法白名单。
#[derive(Debug)]
pub(crate) struct KeyRing {
    active: String,
    keys: HashMap<String, KeyEntry>,
    allowed: Vec<Algorithm>,
}

impl KeyRing {
    /// 构造密钥环；活动密钥必须可签名且算法在白名单内。
    pub(crate) fn new(active: KeyEntry, allowed: Vec<Algorithm>) -> Result<Self, KeyError> {
        if !active.can_sign() {
            return Err(KeyError::CannotSign(active.kid.clone()));
        }
        if !allowed.contains(&active.alg) {
            return Err(KeyError::NotAllowed(active.alg));
        }
        let kid = active.kid.clone();
        let mut keys = HashMap::new();
        keys.insert(kid.clone(), active);
        Ok(Self {
            active: kid,
            keys,
            allowed,
        })
    }

    /// 追加轮换窗口内的验签密钥。
    pub(crate) fn with_key(mut self, entry: KeyEntry) -> Result<Self, KeyError> {
        if self.keys.contains_key(&entry.kid) {
            return Err(KeyError::DuplicateKid(entry.kid));
        }
        if !self.allowed.contains(&entry.alg) {
            return Err(KeyError::NotAllowed(entry.alg));
        }
        self.keys.insert(entry.kid.clone(), entry);
        Ok(self)
    }

    /// 当前签名密钥。
    pub(crate) fn active(&self) -> &KeyEntry {
        // new() 保证活动 kid 一定存在
        &self.keys[&self.active]
    }

    /// 按 header kid 取密钥；缺省 kid 回退到活动密钥。
    pub(crate) fn resolve(&self, kid: Option<&str>) -> Option<&KeyEntry> {
        match kid {
            Some(kid) => self.keys.get(kid),
            None => Some(self.active()),
        }
    }

    pub(crate) fn is_allowed(&self, alg: Algorithm) -> bool {
        self.allowed.contains(&alg)
    }

    /// 全部密钥（kid 排序），doctor 输出使用。
    pub(crate) fn entries(&self) -> Vec<&KeyEntry> {
        let mut entries = self.keys.values().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.kid.cmp(&b.kid));
        entries
    }
}

/// 生成新的密钥材料：HMAC 返回随机密钥，EdDSA 返回 seed。均为 base64url。
pub(crate) fn generate_key_material(alg: Algorithm) -> String {
    let len = match alg {
        Algorithm::Hs256 | Algorithm::EdDsa => 32,
        Algorithm::Hs512 => 64,
    };
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(&buf)
}

/// 计算 keyId：`kid_<sha256 前 10 字节>`。
fn resolve_kid(explicit: Option<&str>, domain: &[u8], material: &[u8]) -> String {
    if let Some(kid) = explicit.map(str::trim).filter(|kid| !kid.is_empty()) {
        return kid.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(b":");
    hasher.update(material);
    let digest = hasher.finalize();
    format!("kid_{}", URL_SAFE_NO_PAD.encode(&digest[..10]))
}

fn decode_32(raw_b64: &str) -> Result<[u8; 32], KeyError> {
    let raw = URL_SAFE_NO_PAD
        .decode(raw_b64.trim().as_bytes())
        .map_err(|_| KeyError::InvalidEd25519)?;
    raw.try_into().map_err(|_| KeyError::InvalidEd25519)
}

fn verify_ed25519(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&bytes)).is_ok()
}

/// 错误信息中只保留 kid，避免把密钥写进日志。
fn redact_descriptor(descriptor: &str) -> String {
    let kid = descriptor.split(':').next().unwrap_or_default().trim();
    format!("{kid}:***")
}

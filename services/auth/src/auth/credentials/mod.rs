//! 凭证库：身份与口令哈希的持久化接口。

mod postgres;

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::error::StoreError;

pub(crate) use self::postgres::PgCredentialStore;

/// 角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Role {
    User,
    Admin,
}

impl Role {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Admin => "ADMIN",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "USER" => Some(Self::User),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// 账号状态；身份从不物理删除，只通过状态停用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum AccountStatus {
    Active,
    Locked,
    Disabled,
}

impl AccountStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Locked => "LOCKED",
            Self::Disabled => "DISABLED",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "LOCKED" => Some(Self::Locked),
            "DISABLED" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// 口令哈希算法标记。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum HashAlg {
    Argon2id,
    /// 历史数据，登录成功后升级为 argon2id。
    Bcrypt,
}

impl HashAlg {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Argon2id => "argon2id",
            Self::Bcrypt => "bcrypt",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "argon2id" => Some(Self::Argon2id),
            "bcrypt" => Some(Self::Bcrypt),
            _ => None,
        }
    }
}

/// 身份记录。
#[derive(Clone)]
pub(crate) struct Identity {
    pub(crate) id: Uuid,
    /// 归一化后的邮箱。
    pub(crate) username: String,
    pub(crate) nickname: String,
    pub(crate) role: Role,
    pub(crate) status: AccountStatus,
    pub(crate) credential_hash: String,
    pub(crate) hash_alg: HashAlg,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("role", &self.role)
            .field("status", &self.status)
            .field("hash_alg", &self.hash_alg)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// 注册时写入的新身份。
#[derive(Debug, Clone)]
pub(crate) struct NewIdentity {
    pub(crate) username: String,
    pub(crate) nickname: String,
    pub(crate) role: Role,
    pub(crate) credential_hash: String,
    pub(crate) hash_alg: HashAlg,
}

/// 凭证库接口。
#[async_trait]
pub(crate) trait CredentialStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError>;

    /// 写入新身份；用户名已存在时返回 `Duplicate`。
    async fn insert(&self, identity: NewIdentity) -> Result<Identity, StoreError>;

    async fn update_credential(
        &self,
        id: Uuid,
        credential_hash: String,
        hash_alg: HashAlg,
    ) -> Result<(), StoreError>;

    async fn set_status(&self, id: Uuid, status: AccountStatus) -> Result<(), StoreError>;

    fn backend(&self) -> &'static str;
}

#[derive(Default)]
struct MemoryInner {
    by_id: HashMap<Uuid, Identity>,
    by_username: HashMap<String, Uuid>,
}

/// 进程内凭证库。
#[derive(Default)]
pub(crate) struct MemoryCredentialStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryCredentialStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_username
            .get(username)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        Ok(self.inner.read().await.by_id.get(&id).cloned())
    }

    async fn insert(&self, identity: NewIdentity) -> Result<Identity, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.by_username.contains_key(&identity.username) {
            return Err(StoreError::Duplicate);
        }
        let now = Utc::now();
        let created = Identity {
            id: Uuid::new_v4(),
            username: identity.username,
            nickname: identity.nickname,
            role: identity.role,
            status: AccountStatus::Active,
            credential_hash: identity.credential_hash,
            hash_alg: identity.hash_alg,
            created_at: now,
            updated_at: now,
        };
        inner
            .by_username
            .insert(created.username.clone(), created.id);
        inner.by_id.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_credential(
        &self,
        id: Uuid,
        credential_hash: String,
        hash_alg: HashAlg,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let identity = inner.by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        identity.credential_hash = credential_hash;
        identity.hash_alg = hash_alg;
        identity.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: AccountStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let identity = inner.by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        identity.status = status;
        identity.updated_at = Utc::now();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{
        AccountStatus, CredentialStore, HashAlg, MemoryCredentialStore, NewIdentity, Role,
    };
    use crate::auth::error::StoreError;

    fn new_identity(username: &str) -> NewIdentity {
        NewIdentity {
            username: username.to_string(),
            nickname: "Alice".to_string(),
            role: Role::User,
            credential_hash: "$argon2id$stub".to_string(),
            hash_alg: HashAlg::Argon2id,
        }
    }

    #[tokio::test]
    async fn insert_then_lookup_by_both_keys() {
        let store = MemoryCredentialStore::new();
        let created = store.insert(new_identity("alice@example.com")).await.unwrap();
        assert_eq!(created.status, AccountStatus::Active);

        let by_name = store
            .find_by_username("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, created.id);
        assert!(store.find_by_id(created.id).await.unwrap().is_some());
        assert!(store.find_by_username("bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = MemoryCredentialStore::new();
        store.insert(new_identity("alice@example.com")).await.unwrap();
        assert_eq!(
            store.insert(new_identity("alice@example.com")).await.unwrap_err(),
            StoreError::Duplicate
        );
    }

    #[tokio::test]
    async fn credential_and_status_updates_apply() {
        let store = MemoryCredentialStore::new();
        let created = store.insert(new_identity("alice@example.com")).await.unwrap();
        store
            .update_credential(created.id, "$2b$new".to_string(), HashAlg::Bcrypt)
            .await
            .unwrap();
        store
            .set_status(created.id, AccountStatus::Locked)
            .await
            .unwrap();

        let loaded = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.credential_hash, "$2b$new");
        assert_eq!(loaded.hash_alg, HashAlg::Bcrypt);
        assert_eq!(loaded.status, AccountStatus::Locked);
        assert_eq!(
            store
                .set_status(Uuid::new_v4(), AccountStatus::Active)
                .await
                .unwrap_err(),
            StoreError::NotFound
        );
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(AccountStatus::parse(" locked "), Some(AccountStatus::Locked));
        assert_eq!(AccountStatus::parse("gone"), None);
        assert_eq!(Role::parse("ADMIN"), Some(Role::Admin));
        assert_eq!(HashAlg::parse("bcrypt"), Some(HashAlg::Bcrypt));
    }
}

//! Postgres 凭证库：`users` 保存资料，`accounts` 保存本地登录凭证。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, postgres::PgPoolOptions};
use uuid::Uuid;

use super::{AccountStatus, CredentialStore, HashAlg, Identity, NewIdentity, Role};
use crate::auth::error::StoreError;

/// 本地账号的 provider 标记。
const LOCAL_PROVIDER: &str = "LOCAL";

const SELECT_IDENTITY: &str = "SELECT u.id, u.email, u.nickname, u.role, u.status, \
     a.credential_hash, a.hash_alg, u.created_at, u.updated_at \
     FROM users u JOIN accounts a ON a.user_id = u.id AND a.provider = 'LOCAL'";

#[derive(FromRow)]
struct IdentityRow {
    id: Uuid,
    email: String,
    nickname: String,
    role: String,
    status: String,
    credential_hash: String,
    hash_alg: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = StoreError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        let role = Role::parse(&row.role)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown role `{}`", row.role)))?;
        let status = AccountStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status `{}`", row.status)))?;
        let hash_alg = HashAlg::parse(&row.hash_alg)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown hash alg `{}`", row.hash_alg)))?;
        Ok(Self {
            id: row.id,
            username: row.email,
            nickname: row.nickname,
            role,
            status,
            credential_hash: row.credential_hash,
            hash_alg,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    /// 建立连接池。
    pub(crate) async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!("{SELECT_IDENTITY} WHERE u.email = $1"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Identity::try_from).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!("{SELECT_IDENTITY} WHERE u.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Identity::try_from).transpose()
    }

    async fn insert(&self, identity: NewIdentity) -> Result<Identity, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            "INSERT INTO users (id, email, nickname, role, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $6)",
        )
        .bind(id)
        .bind(&identity.username)
        .bind(&identity.nickname)
        .bind(identity.role.as_str())
        .bind(AccountStatus::Active.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        sqlx::query(
            "INSERT INTO accounts \
             (id, user_id, provider, provider_id, credential_hash, hash_alg, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(LOCAL_PROVIDER)
        .bind(&identity.username)
        .bind(&identity.credential_hash)
        .bind(identity.hash_alg.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        tx.commit().await.map_err(write_error)?;
        Ok(Identity {
            id,
            username: identity.username,
            nickname: identity.nickname,
            role: identity.role,
            status: AccountStatus::Active,
            credential_hash: identity.credential_hash,
            hash_alg: identity.hash_alg,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_credential(
        &self,
        id: Uuid,
        credential_hash: String,
        hash_alg: HashAlg,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE accounts SET credential_hash = $1, hash_alg = $2, updated_at = now() \
             WHERE user_id = $3 AND provider = $4",
        )
        .bind(credential_hash)
        .bind(hash_alg.as_str())
        .bind(id)
        .bind(LOCAL_PROVIDER)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: AccountStatus) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET status = $1, updated_at = now() WHERE id = $2")
                .bind(status.as_str())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("postgres: {err}"))
}

/// 写入错误：唯一约束冲突单独识别。
fn write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return StoreError::Duplicate;
    }
    backend(err)
}

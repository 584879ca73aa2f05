/// Refresh Token Storage
///
/// One record per outstanding refresh token, keyed by `(user_id, jti)`.
/// Records are never updated in place: rotation deletes the old record and
/// inserts a new one. Only the Argon2 hash of the signed token is stored.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub jti: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: Uuid,
    pub jti: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn create(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord, AppError>;

    async fn find_by_user_and_jti(
        &self,
        user_id: Uuid,
        jti: &str,
    ) -> Result<Option<RefreshTokenRecord>, AppError>;

    /// Oldest record for the user, if any
    async fn find_first_by_user(&self, user_id: Uuid)
        -> Result<Option<RefreshTokenRecord>, AppError>;

    /// Returns the number of records removed (0 or 1)
    async fn delete_by_user_and_jti(&self, user_id: Uuid, jti: &str) -> Result<u64, AppError>;

    async fn delete_all_by_user(&self, user_id: Uuid) -> Result<u64, AppError>;

    /// Remove every record whose expiry is at or before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

type RecordRow = (Uuid, Uuid, String, String, DateTime<Utc>, DateTime<Utc>);

fn from_row((id, user_id, jti, token_hash, expires_at, created_at): RecordRow) -> RefreshTokenRecord {
    RefreshTokenRecord {
        id,
        user_id,
        jti,
        token_hash,
        expires_at,
        created_at,
    }
}

/// Postgres-backed refresh token store
#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn create(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            INSERT INTO refresh_tokens (id, user_id, jti, token_hash, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_id, jti, token_hash, expires_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(token.user_id)
        .bind(&token.jti)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(from_row(row))
    }

    async fn find_by_user_and_jti(
        &self,
        user_id: Uuid,
        jti: &str,
    ) -> Result<Option<RefreshTokenRecord>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, user_id, jti, token_hash, expires_at, created_at
            FROM refresh_tokens
            WHERE user_id = $1 AND jti = $2
            "#,
        )
        .bind(user_id)
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(from_row))
    }

    async fn find_first_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<RefreshTokenRecord>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, user_id, jti, token_hash, expires_at, created_at
            FROM refresh_tokens
            WHERE user_id = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(from_row))
    }

    async fn delete_by_user_and_jti(&self, user_id: Uuid, jti: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1 AND jti = $2")
            .bind(user_id)
            .bind(jti)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_all_by_user(&self, user_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Map-backed refresh token store
#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    records: RwLock<HashMap<(Uuid, String), RefreshTokenRecord>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records held for a user
    pub fn count_for_user(&self, user_id: Uuid) -> usize {
        self.records
            .read()
            .map(|records| records.keys().filter(|(owner, _)| *owner == user_id).count())
            .unwrap_or(0)
    }
}

fn poisoned() -> AppError {
    AppError::Internal("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn create(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord, AppError> {
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: token.user_id,
            jti: token.jti,
            token_hash: token.token_hash,
            expires_at: token.expires_at,
            created_at: Utc::now(),
        };

        let mut records = self.records.write().map_err(|_| poisoned())?;
        let key = (record.user_id, record.jti.clone());
        if records.contains_key(&key) {
            return Err(DatabaseError::UniqueConstraintViolation(
                "refresh_tokens_user_id_jti_key".into(),
            )
            .into());
        }
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn find_by_user_and_jti(
        &self,
        user_id: Uuid,
        jti: &str,
    ) -> Result<Option<RefreshTokenRecord>, AppError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&(user_id, jti.to_string())).cloned())
    }

    async fn find_first_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<RefreshTokenRecord>, AppError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .values()
            .filter(|r| r.user_id == user_id)
            .min_by_key(|r| r.created_at)
            .cloned())
    }

    async fn delete_by_user_and_jti(&self, user_id: Uuid, jti: &str) -> Result<u64, AppError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        Ok(records.remove(&(user_id, jti.to_string())).map_or(0, |_| 1))
    }

    async fn delete_all_by_user(&self, user_id: Uuid) -> Result<u64, AppError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let before = records.len();
        records.retain(|(owner, _), _| *owner != user_id);
        Ok((before - records.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

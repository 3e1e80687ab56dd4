use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DbConn, DbErr, EntityTrait,
    QueryFilter, RuntimeErr, SqlErr, sqlx,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{config::db_conn_capsule, orm::url_mapping, short_code::ShortCode};

const SCHEMA: &str = include_str!("../migrations/0001_create_urls.sql");

pub fn url_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UrlRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(SeaOrmUrlRepository::new(db))
}

/// A mapping that has not been persisted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUrlMapping {
    pub code: ShortCode,
    pub original_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlMapping {
    pub id: Uuid,
    pub code: ShortCode,
    pub original_url: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("short code is already taken")]
    DuplicateCode,
    #[error("no mapping found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(anyhow::Error),
    #[error("internal store error: {0}")]
    Internal(anyhow::Error),
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
            return Self::DuplicateCode;
        }
        if is_connectivity_error(&err) {
            Self::Unavailable(err.into())
        } else {
            Self::Internal(err.into())
        }
    }
}

/// Whether `err` means the database could not be reached, including a
/// connection that dropped while a statement was in flight.
fn is_connectivity_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => matches!(
            **sqlx_err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        ),
        _ => false,
    }
}

/// Storage for [`UrlMapping`]s.
///
/// Implementations own the uniqueness of [`UrlMapping::code`]:
/// [`UrlRepository::create`] must reject a taken code atomically.
#[async_trait]
pub trait UrlRepository: Send + Sync {
    /// Persists `mapping`, assigning its id and timestamps.
    async fn create(&self, mapping: NewUrlMapping) -> Result<UrlMapping, StoreError>;

    async fn get_by_code(&self, code: &ShortCode) -> Result<UrlMapping, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<UrlMapping, StoreError>;

    /// Hard-deletes the mapping; [`StoreError::NotFound`] if nothing was removed.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Applies the `urls` schema. Safe to run on every start.
///
/// # Errors
/// Will return [`Err`] if any schema statement fails.
#[instrument(skip(db))]
pub async fn migrate(db: &DbConn) -> Result<(), DbErr> {
    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        db.execute_unprepared(statement).await?;
    }
    info!("Applied schema migration");
    Ok(())
}

pub struct SeaOrmUrlRepository {
    db: DbConn,
}

impl SeaOrmUrlRepository {
    #[must_use]
    pub const fn new(db: DbConn) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UrlRepository for SeaOrmUrlRepository {
    #[instrument(skip(self))]
    async fn create(&self, mapping: NewUrlMapping) -> Result<UrlMapping, StoreError> {
        let now = OffsetDateTime::now_utc();
        let to_insert = url_mapping::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(mapping.code.into_inner()),
            original_url: Set(mapping.original_url),
            created_at: Set(now),
            updated_at: Set(now),
        };
        to_insert.insert(&self.db).await?.try_into()
    }

    #[instrument(skip(self))]
    async fn get_by_code(&self, code: &ShortCode) -> Result<UrlMapping, StoreError> {
        url_mapping::Entity::find()
            .filter(url_mapping::Column::Code.eq(code.as_str()))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)?
            .try_into()
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<UrlMapping, StoreError> {
        url_mapping::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)?
            .try_into()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = url_mapping::Entity::delete_by_id(id).exec(&self.db).await?;
        match result.rows_affected {
            0 => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), StoreError> {
        self.db.ping().await.map_err(StoreError::from)
    }
}

impl TryFrom<url_mapping::Model> for UrlMapping {
    type Error = StoreError;

    fn try_from(
        url_mapping::Model {
            id,
            code,
            original_url,
            created_at,
            updated_at,
        }: url_mapping::Model,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            id,
            code: ShortCode::new(code)
                .context("Stored short code is malformed")
                .map_err(StoreError::Internal)?,
            original_url,
            created_at,
            updated_at,
        })
    }
}

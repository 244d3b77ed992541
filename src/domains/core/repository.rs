use crate::errors::{DbError, DomainResult};
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

/// Begin a transaction that holds the database write lock from its first statement.
///
/// A deferred transaction that reads before writing cannot upgrade its lock
/// while another connection holds one, and SQLite reports SQLITE_BUSY without
/// consulting the busy timeout. Taking the lock at `BEGIN` makes concurrent
/// writers queue on the timeout instead.
pub async fn begin_write(pool: &SqlitePool) -> DomainResult<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await.map_err(DbError::from)?)
}

/// Trait for finding entities by ID
#[async_trait]
pub trait FindById<T> {
    /// Find an entity by its unique ID. Absent rows are `EntityNotFound`.
    async fn find_by_id(&self, id: Uuid) -> DomainResult<T>;
}

/// Trait for entities that can be removed permanently
#[async_trait]
pub trait HardDeletable {
    /// Name used in log lines and not-found errors
    fn entity_name(&self) -> &'static str;

    async fn hard_delete(&self, id: Uuid) -> DomainResult<()>;

    /// Delete within an existing transaction
    async fn hard_delete_with_tx(
        &self,
        id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;
}

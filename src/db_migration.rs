use crate::errors::{DbError, DbResult};
use log::{debug, info};
use sqlx::SqlitePool;

// Embed all migration SQL files at compile time
const MIGRATION_DOCUMENTS: &str = include_str!("../migrations/20250601000000_documents.sql");
const MIGRATION_FILE_DELETION_QUEUE: &str = include_str!("../migrations/20250601000001_file_deletion_queue.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_documents.sql", MIGRATION_DOCUMENTS),
    ("20250601000001_file_deletion_queue.sql", MIGRATION_FILE_DELETION_QUEUE),
];

/// Apply every migration that has not been recorded yet.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    create_migrations_table(pool).await?;

    let last_migration = get_last_migration(pool).await?;
    match &last_migration {
        Some(name) => debug!("Last applied migration: {}", name),
        None => debug!("No migrations applied yet"),
    }

    apply_pending_migrations(pool, last_migration).await
}

/// Create migrations table if it doesn't exist
async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )"
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Migration(format!("Failed to create migrations table: {}", e)))?;

    Ok(())
}

/// Get the last applied migration
async fn get_last_migration(pool: &SqlitePool) -> DbResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT name FROM migrations ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|e| DbError::Migration(format!("Failed to get last migration: {}", e)))
}

/// Apply pending migrations in a single transaction
async fn apply_pending_migrations(pool: &SqlitePool, last_migration: Option<String>) -> DbResult<()> {
    let pending_migrations = get_pending_migrations(last_migration.as_deref());

    if pending_migrations.is_empty() {
        debug!("No pending migrations to apply");
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DbError::Transaction(format!("Failed to begin migration transaction: {}", e)))?;

    for (migration_name, migration_sql) in pending_migrations {
        sqlx::raw_sql(migration_sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to apply migration {}: {}", migration_name, e)))?;

        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
            .bind(migration_name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to record migration {}: {}", migration_name, e)))?;

        info!("Applied migration {}", migration_name);
    }

    tx.commit()
        .await
        .map_err(|e| DbError::Transaction(format!("Failed to commit migrations: {}", e)))?;

    Ok(())
}

/// Determine which migrations need to be applied
fn get_pending_migrations(last_migration: Option<&str>) -> Vec<(&'static str, &'static str)> {
    let mut pending = Vec::new();
    let mut should_include = last_migration.is_none();

    for &(migration_name, migration_sql) in MIGRATIONS {
        if should_include {
            pending.push((migration_name, migration_sql));
        } else if Some(migration_name) == last_migration {
            // Found the last applied migration, include all subsequent ones
            should_include = true;
        }
    }

    pending
}

//! SQLite connection pool and schema migration.
//!
//! The migration is applied inline via `include_str!` on every open; all
//! statements are idempotent.

use std::path::Path;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Kernel schema: clinic tables, audit log, grants and feature flags.
pub const SCHEMA_SQL: &str = include_str!("../migrations/001_kernel_schema.sql");

/// Open (or create) the database at `path` and apply the schema.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migration fails.
pub async fn open(path: &Path, max_connections: u32) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    // Referential integrity is enforced by the kernel, not the store, so
    // that the integrity monitor can observe rows that bypassed it.
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .pragma("trusted_schema", "OFF")
        .pragma("foreign_keys", "OFF");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    migrate(&pool).await?;
    tracing::info!(path = %path.display(), max_connections, "database opened");
    Ok(pool)
}

/// Open a private in-memory database with the schema applied.
///
/// In-memory databases are per-connection, so the pool holds exactly one.
///
/// # Errors
///
/// Returns an error if the connection or migration fails.
pub async fn open_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .create_if_missing(true)
        .pragma("foreign_keys", "OFF");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply the kernel schema.
///
/// # Errors
///
/// Returns an error if any statement fails.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to apply kernel schema migration")?;
    Ok(())
}

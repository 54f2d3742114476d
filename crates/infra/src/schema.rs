//! Database schema bootstrap.

use sqlx::PgPool;
use tracing::info;

use crate::db::{DbError, map_sqlx_error};

/// Full schema; every statement is idempotent.
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Create any missing tables and indexes.
pub async fn apply(pool: &PgPool) -> Result<(), DbError> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    info!("database schema applied");
    Ok(())
}

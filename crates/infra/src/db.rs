//! Postgres connection and error mapping shared by the SQLx stores.
//!
//! | SQLx error | Postgres code | `DbError` |
//! |------------|---------------|-----------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (check violation) | `23514` | `CheckViolation` |
//! | anything else | | `Other` |

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("unique violation in {operation}: {message}")]
    UniqueViolation { operation: String, message: String },

    #[error("check violation in {operation}: {message}")]
    CheckViolation { operation: String, message: String },

    #[error("database error in {operation}: {message}")]
    Other { operation: String, message: String },
}

/// Map SQLx errors to [`DbError`], tagging the failing operation.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DbError {
    let operation = operation.to_string();
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") => DbError::UniqueViolation { operation, message },
                Some("23514") => DbError::CheckViolation { operation, message },
                _ => DbError::Other { operation, message },
            }
        }
        sqlx::Error::PoolClosed => DbError::Other {
            operation,
            message: "connection pool closed".to_string(),
        },
        other => DbError::Other {
            operation,
            message: other.to_string(),
        },
    }
}

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Read a column, mapping decode failures to [`DbError`].
pub(crate) fn col<'r, T>(row: &'r sqlx::postgres::PgRow, name: &str) -> Result<T, DbError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    use sqlx::Row;
    row.try_get(name).map_err(|e| DbError::Other {
        operation: format!("decode {name}"),
        message: e.to_string(),
    })
}

/// Convert a stored non-negative BIGINT.
pub(crate) fn to_u64(value: i64, name: &str) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::Other {
        operation: format!("decode {name}"),
        message: format!("negative value {value}"),
    })
}

/// Convert an in-memory count for binding as BIGINT.
pub(crate) fn to_i64(value: u64, name: &str) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|_| DbError::Other {
        operation: format!("encode {name}"),
        message: format!("value {value} out of range"),
    })
}

/// Escape `%`, `_` and `\` for a LIKE pattern.
pub(crate) fn like_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

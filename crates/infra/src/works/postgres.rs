//! Postgres-backed work archive.
//!
//! Ownership is part of every query; a foreign work is indistinguishable from
//! a missing one.

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use artforge_core::{Page, PageRequest, PredictionId, UserId, WorkId};
use artforge_predictions::{OperationKind, Work, WorkFilter};

use super::{WorkArchive, WorkArchiveError};
use crate::db::{DbError, col, like_escape, map_sqlx_error, to_i64, to_u64};

const COLUMNS: &str = "id, user_id, prediction_id, title, kind, original_image, processed_image, \
     metadata, completed_at, processing_ms, created_at";

#[derive(Debug, Clone)]
pub struct PostgresWorkArchive {
    pool: Arc<PgPool>,
}

impl PostgresWorkArchive {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, user_id: UserId, filter: &WorkFilter) {
    qb.push(" WHERE user_id = ").push_bind(*user_id.as_uuid());
    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(search) = &filter.search {
        qb.push(" AND title ILIKE ")
            .push_bind(format!("%{}%", like_escape(search)))
            .push(" ESCAPE '\\'");
    }
}

#[async_trait::async_trait]
impl WorkArchive for PostgresWorkArchive {
    #[instrument(skip(self, work), fields(prediction_id = %work.prediction_id, user_id = %work.user_id), err)]
    async fn create(&self, work: Work) -> Result<Work, WorkArchiveError> {
        let processing_ms = work
            .processing_ms
            .map(|ms| to_i64(ms, "processing_ms"))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO works (
                id, user_id, prediction_id, title, kind, original_image, processed_image,
                metadata, completed_at, processing_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (prediction_id) DO NOTHING
            "#,
        )
        .bind(work.id.as_uuid())
        .bind(work.user_id.as_uuid())
        .bind(work.prediction_id.as_str())
        .bind(&work.title)
        .bind(work.kind.as_str())
        .bind(&work.original_image)
        .bind(&work.processed_image)
        .bind(&work.metadata)
        .bind(work.completed_at)
        .bind(processing_ms)
        .bind(work.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_work", e))?;

        // Either our row or the one a previous attempt stored.
        self.find_by_prediction(&work.prediction_id)
            .await?
            .ok_or_else(|| WorkArchiveError::Storage("work vanished after insert".to_string()))
    }

    #[instrument(skip(self), fields(prediction_id = %prediction_id), err)]
    async fn find_by_prediction(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<Work>, WorkArchiveError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM works WHERE prediction_id = $1"))
            .bind(prediction_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_work", e))?;
        row.as_ref().map(work_from_row).transpose()
    }

    #[instrument(skip(self, filter, page), fields(user_id = %user_id, kind = ?filter.kind, limit = page.limit), err)]
    async fn list_for_user(
        &self,
        user_id: UserId,
        filter: &WorkFilter,
        page: PageRequest,
    ) -> Result<Page<Work>, WorkArchiveError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM works");
        push_filter(&mut count, user_id, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_works", e))?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM works"));
        push_filter(&mut select, user_id, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);

        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_works", e))?;

        let items = rows
            .iter()
            .map(work_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total, "total")?, page))
    }

    #[instrument(skip(self), fields(work_id = %work_id, user_id = %user_id), err)]
    async fn delete(&self, work_id: WorkId, user_id: UserId) -> Result<bool, WorkArchiveError> {
        let result = sqlx::query("DELETE FROM works WHERE id = $1 AND user_id = $2")
            .bind(work_id.as_uuid())
            .bind(user_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_work", e))?;
        Ok(result.rows_affected() == 1)
    }
}

fn work_from_row(row: &PgRow) -> Result<Work, WorkArchiveError> {
    let prediction_id: String = col(row, "prediction_id")?;
    let kind: String = col(row, "kind")?;
    let processing_ms: Option<i64> = col(row, "processing_ms")?;
    let decode = |column: &str, message: String| DbError::Other {
        operation: format!("decode {column}"),
        message,
    };

    Ok(Work {
        id: WorkId::from_uuid(col(row, "id")?),
        user_id: UserId::from_uuid(col(row, "user_id")?),
        prediction_id: PredictionId::new(prediction_id)
            .map_err(|e| decode("prediction_id", e.to_string()))?,
        title: col(row, "title")?,
        kind: kind
            .parse::<OperationKind>()
            .map_err(|e| decode("kind", e.to_string()))?,
        original_image: col(row, "original_image")?,
        processed_image: col(row, "processed_image")?,
        metadata: col(row, "metadata")?,
        completed_at: col(row, "completed_at")?,
        processing_ms: processing_ms
            .map(|ms| to_u64(ms, "processing_ms"))
            .transpose()?,
        created_at: col(row, "created_at")?,
    })
}

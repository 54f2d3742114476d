//! Postgres-backed job store.
//!
//! `upsert` locks the job row (`SELECT ... FOR UPDATE`), runs the state
//! machine in Rust and writes back only when the update applied or was a
//! redelivery.

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgRow;
use tracing::{Span, instrument};

use artforge_core::{Page, PageRequest, PredictionId, UserId};
use artforge_predictions::{Prediction, PredictionUpdate, SideEffect, ToolInput, Transition};

use super::{PredictionStore, PredictionStoreError, Upserted};
use crate::db::{DbError, col, map_sqlx_error, to_i64, to_u64};

const COLUMNS: &str = "id, user_id, kind, model, status, input, output, error, metrics, \
     points_reserved, created_at, started_at, completed_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresPredictionStore {
    pool: Arc<PgPool>,
}

impl PostgresPredictionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl PredictionStore for PostgresPredictionStore {
    #[instrument(skip(self, prediction), fields(prediction_id = %prediction.id, user_id = %prediction.user_id), err)]
    async fn create(&self, prediction: &Prediction) -> Result<(), PredictionStoreError> {
        let input = serde_json::to_value(&prediction.input)
            .map_err(|e| PredictionStoreError::Storage(e.to_string()))?;
        let output = prediction
            .output
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| PredictionStoreError::Storage(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO predictions (
                id, user_id, kind, model, status, input, output, error, metrics,
                points_reserved, created_at, started_at, completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(prediction.id.as_str())
        .bind(prediction.user_id.as_uuid())
        .bind(prediction.kind.as_str())
        .bind(&prediction.model)
        .bind(prediction.status.as_str())
        .bind(input)
        .bind(output)
        .bind(&prediction.error)
        .bind(&prediction.metrics)
        .bind(to_i64(prediction.points_reserved, "points_reserved")?)
        .bind(prediction.created_at)
        .bind(prediction.started_at)
        .bind(prediction.completed_at)
        .bind(prediction.updated_at)
        .execute(&*self.pool)
        .await;

        match result.map_err(|e| map_sqlx_error("create_prediction", e)) {
            Ok(_) => Ok(()),
            Err(DbError::UniqueViolation { .. }) => {
                Err(PredictionStoreError::AlreadyExists(prediction.id.clone()))
            }
            Err(other) => Err(other.into()),
        }
    }

    #[instrument(skip(self), fields(prediction_id = %id), err)]
    async fn get(&self, id: &PredictionId) -> Result<Option<Prediction>, PredictionStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM predictions WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_prediction", e))?;
        row.as_ref().map(prediction_from_row).transpose()
    }

    #[instrument(
        skip(self, update),
        fields(prediction_id = %update.id, status = update.status.as_str(), transition = tracing::field::Empty),
        err
    )]
    async fn upsert(
        &self,
        update: &PredictionUpdate,
    ) -> Result<Option<Upserted>, PredictionStoreError> {
        let operation = "upsert_prediction";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM predictions WHERE id = $1 FOR UPDATE"
        ))
        .bind(update.id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut prediction = prediction_from_row(&row)?;
        let transition = prediction.apply_update(update)?;
        Span::current().record("transition", transition.as_str());

        if matches!(transition, Transition::Apply | Transition::Redelivery) {
            let output = prediction
                .output
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| PredictionStoreError::Storage(e.to_string()))?;

            sqlx::query(
                r#"
                UPDATE predictions
                SET status = $2, output = $3, error = $4, metrics = $5,
                    started_at = $6, completed_at = $7, updated_at = $8
                WHERE id = $1
                "#,
            )
            .bind(prediction.id.as_str())
            .bind(prediction.status.as_str())
            .bind(output)
            .bind(&prediction.error)
            .bind(&prediction.metrics)
            .bind(prediction.started_at)
            .bind(prediction.completed_at)
            .bind(prediction.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(Some(Upserted {
            prediction,
            transition,
        }))
    }

    #[instrument(skip(self, page), fields(user_id = %user_id, limit = page.limit, offset = page.offset), err)]
    async fn list_for_user(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<Prediction>, PredictionStoreError> {
        let operation = "list_predictions";
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM predictions WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM predictions WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.as_uuid())
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        let items = rows
            .iter()
            .map(prediction_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total, "total")?, page))
    }

    #[instrument(skip(self), fields(prediction_id = %id, effect = effect.as_str()), err)]
    async fn has_applied(
        &self,
        id: &PredictionId,
        effect: SideEffect,
    ) -> Result<bool, PredictionStoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM applied_side_effects WHERE prediction_id = $1 AND effect = $2)",
        )
        .bind(id.as_str())
        .bind(effect.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_applied", e))?;
        Ok(exists)
    }

    #[instrument(skip(self), fields(prediction_id = %id, effect = effect.as_str()), err)]
    async fn record_applied(
        &self,
        id: &PredictionId,
        effect: SideEffect,
    ) -> Result<bool, PredictionStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO applied_side_effects (prediction_id, effect)
            VALUES ($1, $2)
            ON CONFLICT (prediction_id, effect) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(effect.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_applied", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(prediction_id = %id), err)]
    async fn applied(&self, id: &PredictionId) -> Result<Vec<SideEffect>, PredictionStoreError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT effect FROM applied_side_effects WHERE prediction_id = $1",
        )
        .bind(id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("applied", e))?;

        let mut effects = rows
            .iter()
            .map(|s| s.parse::<SideEffect>())
            .collect::<Result<Vec<_>, _>>()?;
        effects.sort();
        Ok(effects)
    }
}

fn decode_err(column: &str, err: impl std::fmt::Display) -> PredictionStoreError {
    PredictionStoreError::from(DbError::Other {
        operation: format!("decode {column}"),
        message: err.to_string(),
    })
}

fn prediction_from_row(row: &PgRow) -> Result<Prediction, PredictionStoreError> {
    let id: String = col(row, "id")?;
    let kind: String = col(row, "kind")?;
    let status: String = col(row, "status")?;
    let input: serde_json::Value = col(row, "input")?;
    let output: Option<serde_json::Value> = col(row, "output")?;

    let input: ToolInput = serde_json::from_value(input).map_err(|e| decode_err("input", e))?;
    let output = output
        .map(serde_json::from_value::<Vec<String>>)
        .transpose()
        .map_err(|e| decode_err("output", e))?;

    Ok(Prediction {
        id: PredictionId::new(id).map_err(|e| decode_err("id", e))?,
        user_id: UserId::from_uuid(col(row, "user_id")?),
        kind: kind.parse().map_err(|e| decode_err("kind", e))?,
        model: col(row, "model")?,
        status: status.parse().map_err(|e| decode_err("status", e))?,
        input,
        output,
        error: col(row, "error")?,
        metrics: col(row, "metrics")?,
        points_reserved: to_u64(col(row, "points_reserved")?, "points_reserved")?,
        created_at: col(row, "created_at")?,
        started_at: col(row, "started_at")?,
        completed_at: col(row, "completed_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

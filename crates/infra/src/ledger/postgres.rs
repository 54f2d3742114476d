//! Postgres-backed ledger.
//!
//! Every mutation runs in one transaction that first takes
//! `SELECT ... FOR UPDATE` on the user's balance row, then on the reservation
//! row when one is involved. The fixed lock order keeps refunds and reserves
//! for the same user from deadlocking.
//!
//! The table-level checks (`points >= 0`, `balance_after = balance_before +
//! amount`, one refund per reservation) back up the rules in
//! `artforge_ledger::ops`.

use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use artforge_core::{Page, PageRequest, PredictionId, UserId};
use artforge_ledger::{
    EntryId, LedgerEntry, PlanTier, RedemptionCode, Reservation, ReservationId, Reserved,
    Settlement, TransactionKind, UserBalance, normalize_code,
};

use super::{LedgerError, LedgerStore, Redeemed};
use crate::db::{DbError, col, map_sqlx_error, to_i64, to_u64};

const BALANCE_COLUMNS: &str =
    "user_id, points, plan, plan_points, plan_expires_at, created_at, updated_at";
const RESERVATION_COLUMNS: &str =
    "id, user_id, prediction_id, points, state, reserved_at, settled_at";
const ENTRY_COLUMNS: &str = "id, user_id, amount, kind, balance_before, balance_after, \
     prediction_id, reservation_id, metadata, created_at";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, LedgerError> {
        Ok(self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?)
    }

    async fn lock_balance(
        tx: &mut Transaction<'static, Postgres>,
        user_id: UserId,
        operation: &str,
    ) -> Result<UserBalance, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        match row {
            Some(row) => Ok(balance_from_row(&row)?),
            None => Err(LedgerError::AccountNotFound(user_id)),
        }
    }

    async fn lock_reservation(
        tx: &mut Transaction<'static, Postgres>,
        reservation_id: ReservationId,
        operation: &str,
    ) -> Result<Reservation, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(reservation_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        match row {
            Some(row) => Ok(reservation_from_row(&row)?),
            None => Err(LedgerError::ReservationNotFound(reservation_id.to_string())),
        }
    }

    /// Owner and id of the reservation bound to a job, without locking.
    async fn locate(
        &self,
        prediction_id: &PredictionId,
        operation: &str,
    ) -> Result<(UserId, ReservationId), LedgerError> {
        let row = sqlx::query("SELECT id, user_id FROM reservations WHERE prediction_id = $1")
            .bind(prediction_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or_else(|| LedgerError::ReservationNotFound(prediction_id.to_string()))?;
        let id: Uuid = col(&row, "id")?;
        let user_id: Uuid = col(&row, "user_id")?;
        Ok((UserId::from_uuid(user_id), ReservationId::from_uuid(id)))
    }

    async fn refund_reservation(
        &self,
        user_id: UserId,
        reservation_id: ReservationId,
        operation: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let mut tx = self.begin(operation).await?;
        let mut balance = Self::lock_balance(&mut tx, user_id, operation).await?;
        let mut reservation = Self::lock_reservation(&mut tx, reservation_id, operation).await?;

        let entry = artforge_ledger::refund(&mut balance, &mut reservation, Utc::now())?;
        if let Some(entry) = &entry {
            write_reservation_state(&mut tx, &reservation, operation).await?;
            write_balance(&mut tx, &balance, operation).await?;
            insert_entry(&mut tx, entry, operation).await?;
        } else if reservation.points == 0 {
            // Zero-point reservations still settle.
            write_reservation_state(&mut tx, &reservation, operation).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(entry)
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(user_id = %user_id, operation = "open_account"), err)]
    async fn open_account(&self, user_id: UserId) -> Result<UserBalance, LedgerError> {
        let fresh = UserBalance::open(user_id, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, points, plan, plan_points, created_at, updated_at)
            VALUES ($1, 0, $2, 0, $3, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(fresh.plan.as_str())
        .bind(fresh.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_account", e))?;

        self.balance(user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))
    }

    #[instrument(skip(self), fields(user_id = %user_id, operation = "balance"), err)]
    async fn balance(&self, user_id: UserId) -> Result<Option<UserBalance>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM user_balances WHERE user_id = $1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balance", e))?;

        Ok(row.as_ref().map(balance_from_row).transpose()?)
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn check_balance(&self, user_id: UserId, required: u64) -> Result<(), LedgerError> {
        let balance = self
            .balance(user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;
        balance.ensure_covers(required)?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id, reservation_id = tracing::field::Empty), err)]
    async fn reserve(&self, user_id: UserId, points: u64) -> Result<Reservation, LedgerError> {
        let operation = "reserve";
        let mut tx = self.begin(operation).await?;
        let mut balance = Self::lock_balance(&mut tx, user_id, operation).await?;

        let Reserved { reservation, entry } =
            artforge_ledger::reserve(&mut balance, points, Utc::now())?;
        Span::current().record("reservation_id", tracing::field::display(reservation.id));

        sqlx::query(
            r#"
            INSERT INTO reservations (id, user_id, prediction_id, points, state, reserved_at, settled_at)
            VALUES ($1, $2, NULL, $3, $4, $5, NULL)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(to_i64(reservation.points, "points")?)
        .bind(reservation.state.as_str())
        .bind(reservation.reserved_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if let Some(entry) = &entry {
            write_balance(&mut tx, &balance, operation).await?;
            insert_entry(&mut tx, entry, operation).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(reservation)
    }

    #[instrument(skip(self), fields(reservation_id = %reservation_id, prediction_id = %prediction_id), err)]
    async fn attach(
        &self,
        reservation_id: ReservationId,
        prediction_id: &PredictionId,
    ) -> Result<Reservation, LedgerError> {
        let operation = "attach";
        let mut tx = self.begin(operation).await?;
        let mut reservation = Self::lock_reservation(&mut tx, reservation_id, operation).await?;
        reservation.attach(prediction_id.clone())?;

        // The unique index on prediction_id rejects a second reservation for the job.
        sqlx::query("UPDATE reservations SET prediction_id = $2 WHERE id = $1")
            .bind(reservation_id.as_uuid())
            .bind(prediction_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(reservation)
    }

    #[instrument(skip(self), fields(reservation_id = %reservation_id), err)]
    async fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query("SELECT user_id FROM reservations WHERE id = $1")
            .bind(reservation_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?
            .ok_or_else(|| LedgerError::ReservationNotFound(reservation_id.to_string()))?;
        let user_id = UserId::from_uuid(col(&row, "user_id")?);
        self.refund_reservation(user_id, reservation_id, "release")
            .await
    }

    #[instrument(skip(self), fields(prediction_id = %prediction_id), err)]
    async fn commit(&self, prediction_id: &PredictionId) -> Result<Settlement, LedgerError> {
        let operation = "commit";
        let (_, reservation_id) = self.locate(prediction_id, operation).await?;

        let mut tx = self.begin(operation).await?;
        let mut reservation = Self::lock_reservation(&mut tx, reservation_id, operation).await?;
        let settlement = reservation.commit(Utc::now())?;
        if settlement == Settlement::Applied {
            write_reservation_state(&mut tx, &reservation, operation).await?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(settlement)
    }

    #[instrument(skip(self), fields(prediction_id = %prediction_id), err)]
    async fn refund(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let (user_id, reservation_id) = self.locate(prediction_id, "refund").await?;
        self.refund_reservation(user_id, reservation_id, "refund")
            .await
    }

    #[instrument(skip(self, metadata), fields(user_id = %user_id, kind = kind.as_str()), err)]
    async fn credit(
        &self,
        user_id: UserId,
        points: u64,
        kind: TransactionKind,
        metadata: serde_json::Value,
    ) -> Result<LedgerEntry, LedgerError> {
        let operation = "credit";
        let mut tx = self.begin(operation).await?;
        let mut balance = Self::lock_balance(&mut tx, user_id, operation).await?;
        let entry = artforge_ledger::credit(&mut balance, points, kind, metadata, Utc::now())?;
        write_balance(&mut tx, &balance, operation).await?;
        insert_entry(&mut tx, &entry, operation).await?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(entry)
    }

    #[instrument(skip(self), fields(prediction_id = %prediction_id), err)]
    async fn reservation(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE prediction_id = $1"
        ))
        .bind(prediction_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservation", e))?;
        Ok(row.as_ref().map(reservation_from_row).transpose()?)
    }

    #[instrument(skip(self, page), fields(user_id = %user_id, limit = page.limit, offset = page.offset), err)]
    async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        let operation = "transactions";
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;

        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE user_id = $1 \
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
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total, "total")?, page))
    }

    #[instrument(skip(self, code), fields(code = %code.code), err)]
    async fn create_code(&self, code: RedemptionCode) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO redemption_codes (code, points, plan, plan_days, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&code.code)
        .bind(to_i64(code.points, "points")?)
        .bind(code.plan.map(|p| p.as_str()))
        .bind(code.plan_days as i32)
        .bind(code.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_code", e))?;
        Ok(())
    }

    #[instrument(skip(self, code), fields(user_id = %user_id), err)]
    async fn redeem(&self, user_id: UserId, code: &str) -> Result<Redeemed, LedgerError> {
        let operation = "redeem";
        let key = normalize_code(code);
        let mut tx = self.begin(operation).await?;
        let mut balance = Self::lock_balance(&mut tx, user_id, operation).await?;

        let row = sqlx::query(
            r#"
            SELECT code, points, plan, plan_days, redeemed_by, redeemed_at, created_at
            FROM redemption_codes
            WHERE code = $1
            FOR UPDATE
            "#,
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or(LedgerError::CodeNotFound)?;
        let mut redemption = code_from_row(&row)?;

        let entry = artforge_ledger::redeem(&mut balance, &mut redemption, Utc::now())?;

        sqlx::query(
            "UPDATE redemption_codes SET redeemed_by = $2, redeemed_at = $3 WHERE code = $1",
        )
        .bind(&redemption.code)
        .bind(redemption.redeemed_by.map(|u| *u.as_uuid()))
        .bind(redemption.redeemed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        write_balance(&mut tx, &balance, operation).await?;
        if let Some(entry) = &entry {
            insert_entry(&mut tx, entry, operation).await?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(Redeemed { balance, entry })
    }
}

async fn write_balance(
    tx: &mut Transaction<'static, Postgres>,
    balance: &UserBalance,
    operation: &str,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        UPDATE user_balances
        SET points = $2, plan = $3, plan_points = $4, plan_expires_at = $5, updated_at = $6
        WHERE user_id = $1
        "#,
    )
    .bind(balance.user_id.as_uuid())
    .bind(to_i64(balance.points, "points")?)
    .bind(balance.plan.as_str())
    .bind(to_i64(balance.plan_points, "plan_points")?)
    .bind(balance.plan_expires_at)
    .bind(balance.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn write_reservation_state(
    tx: &mut Transaction<'static, Postgres>,
    reservation: &Reservation,
    operation: &str,
) -> Result<(), LedgerError> {
    sqlx::query("UPDATE reservations SET state = $2, settled_at = $3 WHERE id = $1")
        .bind(reservation.id.as_uuid())
        .bind(reservation.state.as_str())
        .bind(reservation.settled_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn insert_entry(
    tx: &mut Transaction<'static, Postgres>,
    entry: &LedgerEntry,
    operation: &str,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (
            id, user_id, amount, kind, balance_before, balance_after,
            prediction_id, reservation_id, metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.user_id.as_uuid())
    .bind(entry.amount)
    .bind(entry.kind.as_str())
    .bind(to_i64(entry.balance_before, "balance_before")?)
    .bind(to_i64(entry.balance_after, "balance_after")?)
    .bind(entry.prediction_id.as_ref().map(PredictionId::as_str))
    .bind(entry.reservation_id.map(|r| *r.as_uuid()))
    .bind(&entry.metadata)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

fn decode_err(column: &str, err: impl std::fmt::Display) -> DbError {
    DbError::Other {
        operation: format!("decode {column}"),
        message: err.to_string(),
    }
}

fn balance_from_row(row: &PgRow) -> Result<UserBalance, DbError> {
    let plan: String = col(row, "plan")?;
    Ok(UserBalance {
        user_id: UserId::from_uuid(col(row, "user_id")?),
        points: to_u64(col(row, "points")?, "points")?,
        plan: plan.parse::<PlanTier>().map_err(|e| decode_err("plan", e))?,
        plan_points: to_u64(col(row, "plan_points")?, "plan_points")?,
        plan_expires_at: col(row, "plan_expires_at")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, DbError> {
    let prediction_id: Option<String> = col(row, "prediction_id")?;
    let state: String = col(row, "state")?;
    Ok(Reservation {
        id: ReservationId::from_uuid(col(row, "id")?),
        user_id: UserId::from_uuid(col(row, "user_id")?),
        prediction_id: prediction_id
            .map(PredictionId::new)
            .transpose()
            .map_err(|e| decode_err("prediction_id", e))?,
        points: to_u64(col(row, "points")?, "points")?,
        state: state.parse().map_err(|e| decode_err("state", e))?,
        reserved_at: col(row, "reserved_at")?,
        settled_at: col(row, "settled_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, DbError> {
    let kind: String = col(row, "kind")?;
    let prediction_id: Option<String> = col(row, "prediction_id")?;
    let reservation_id: Option<Uuid> = col(row, "reservation_id")?;
    Ok(LedgerEntry {
        id: EntryId::from_uuid(col(row, "id")?),
        user_id: UserId::from_uuid(col(row, "user_id")?),
        amount: col(row, "amount")?,
        kind: kind.parse().map_err(|e| decode_err("kind", e))?,
        balance_before: to_u64(col(row, "balance_before")?, "balance_before")?,
        balance_after: to_u64(col(row, "balance_after")?, "balance_after")?,
        prediction_id: prediction_id
            .map(PredictionId::new)
            .transpose()
            .map_err(|e| decode_err("prediction_id", e))?,
        reservation_id: reservation_id.map(ReservationId::from_uuid),
        metadata: col(row, "metadata")?,
        created_at: col(row, "created_at")?,
    })
}

fn code_from_row(row: &PgRow) -> Result<RedemptionCode, DbError> {
    let plan: Option<String> = col(row, "plan")?;
    let plan_days: i32 = col(row, "plan_days")?;
    let redeemed_by: Option<Uuid> = col(row, "redeemed_by")?;
    Ok(RedemptionCode {
        code: col(row, "code")?,
        points: to_u64(col(row, "points")?, "points")?,
        plan: plan
            .map(|p| p.parse::<PlanTier>())
            .transpose()
            .map_err(|e| decode_err("plan", e))?,
        plan_days: u32::try_from(plan_days).map_err(|e| decode_err("plan_days", e))?,
        redeemed_by: redeemed_by.map(UserId::from_uuid),
        redeemed_at: col(row, "redeemed_at")?,
        created_at: col(row, "created_at")?,
    })
}

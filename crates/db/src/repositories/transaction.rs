use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use poltergeist_core::domain::cart::CartId;
use poltergeist_core::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use poltergeist_core::domain::user::UserId;
use poltergeist_core::ledger::ReservationToken;

use super::{RepositoryError, TransactionRepository};
use crate::DbPool;

pub struct SqlTransactionRepository {
    pool: DbPool,
}

impl SqlTransactionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "id,
    cart_id,
    user_identifier,
    amount,
    currency,
    status,
    reservation_token,
    receipt_ref,
    failure_reason,
    prev_hash,
    entry_hash,
    signature,
    created_at,
    updated_at";

#[async_trait::async_trait]
impl TransactionRepository for SqlTransactionRepository {
    async fn latest_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS}
             FROM transactions
             WHERE user_identifier = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| transaction_from_row(&row)).transpose()
    }

    async fn append(&self, transaction: Transaction) -> Result<(), RepositoryError> {
        // Plain INSERT. A duplicate id trips the primary key, which is the
        // append-only guarantee at the storage layer.
        sqlx::query(
            "INSERT INTO transactions (
                id,
                cart_id,
                user_identifier,
                amount,
                currency,
                status,
                reservation_token,
                receipt_ref,
                failure_reason,
                prev_hash,
                entry_hash,
                signature,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transaction.id.0)
        .bind(&transaction.cart_id.0)
        .bind(&transaction.user_id.0)
        .bind(transaction.amount.to_string())
        .bind(&transaction.currency)
        .bind(transaction.status.as_str())
        .bind(&transaction.reservation_token.0)
        .bind(transaction.receipt_ref.as_deref())
        .bind(transaction.failure_reason.as_deref())
        .bind(transaction.prev_hash.as_deref())
        .bind(transaction.entry_hash.as_deref())
        .bind(transaction.signature.as_deref())
        .bind(transaction.created_at.to_rfc3339())
        .bind(transaction.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn settle(&self, transaction: &Transaction) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE transactions SET
                status = ?,
                receipt_ref = ?,
                failure_reason = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(transaction.status.as_str())
        .bind(transaction.receipt_ref.as_deref())
        .bind(transaction.failure_reason.as_deref())
        .bind(transaction.updated_at.to_rfc3339())
        .bind(&transaction.id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Decode(format!(
                "settle targeted unknown transaction `{}`",
                transaction.id.0
            )));
        }

        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<Transaction>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS}
             FROM transactions
             WHERE user_identifier = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?"
        ))
        .bind(&user_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = TransactionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown transaction status `{status_raw}`"))
    })?;

    Ok(Transaction {
        id: TransactionId(row.try_get("id")?),
        cart_id: CartId(row.try_get("cart_id")?),
        user_id: UserId(row.try_get("user_identifier")?),
        amount: parse_decimal("amount", &row.try_get::<String, _>("amount")?)?,
        currency: row.try_get("currency")?,
        status,
        reservation_token: ReservationToken(row.try_get("reservation_token")?),
        receipt_ref: row.try_get("receipt_ref")?,
        failure_reason: row.try_get("failure_reason")?,
        prev_hash: row.try_get("prev_hash")?,
        entry_hash: row.try_get("entry_hash")?,
        signature: row.try_get("signature")?,
        created_at: parse_timestamp("created_at", &row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp("updated_at", &row.try_get::<String, _>("updated_at")?)?,
    })
}

fn parse_decimal(column: &str, value: &str) -> Result<Decimal, RepositoryError> {
    value.parse::<Decimal>().map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

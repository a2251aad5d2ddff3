use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::warn;

use poltergeist_core::domain::user::{OverLimitPolicy, UnknownUserPolicy, UserId};
use poltergeist_core::ledger::{
    check_capacity, validate_limit, LedgerError, LedgerStatus, Reservation, ReservationState,
    ReservationToken, SpendingLedger,
};

use crate::DbPool;

/// SQLite-backed ledger. Every monetary transition runs inside one database
/// transaction so the capacity check and the balance update are atomic even
/// with concurrent checkouts.
pub struct SqlSpendingLedger {
    pool: DbPool,
    unknown_user_policy: UnknownUserPolicy,
    default_on_limit: OverLimitPolicy,
}

impl SqlSpendingLedger {
    pub fn new(
        pool: DbPool,
        unknown_user_policy: UnknownUserPolicy,
        default_on_limit: OverLimitPolicy,
    ) -> Self {
        Self { pool, unknown_user_policy, default_on_limit }
    }
}

struct AccountRow {
    limit: Option<Decimal>,
    spent: Decimal,
    reserved: Decimal,
    on_limit: OverLimitPolicy,
}

fn account_from_row(row: &SqliteRow) -> Result<AccountRow, LedgerError> {
    let limit = row
        .try_get::<Option<String>, _>("limit_value")
        .map_err(storage)?
        .map(|value| parse_amount("limit_value", &value))
        .transpose()?;
    let on_limit_raw = row.try_get::<String, _>("on_limit").map_err(storage)?;
    let on_limit = OverLimitPolicy::parse(&on_limit_raw)
        .ok_or_else(|| LedgerError::Storage(format!("unknown on_limit value `{on_limit_raw}`")))?;

    Ok(AccountRow {
        limit,
        spent: parse_amount("spent", &row.try_get::<String, _>("spent").map_err(storage)?)?,
        reserved: parse_amount(
            "reserved",
            &row.try_get::<String, _>("reserved").map_err(storage)?,
        )?,
        on_limit,
    })
}

fn reservation_from_row(row: &SqliteRow) -> Result<Reservation, LedgerError> {
    let state_raw = row.try_get::<String, _>("state").map_err(storage)?;
    let state = ReservationState::parse(&state_raw).ok_or_else(|| {
        LedgerError::Storage(format!("unknown reservation state `{state_raw}`"))
    })?;

    Ok(Reservation {
        token: ReservationToken(row.try_get("token").map_err(storage)?),
        user_id: UserId(row.try_get("user_identifier").map_err(storage)?),
        amount: parse_amount("amount", &row.try_get::<String, _>("amount").map_err(storage)?)?,
        state,
        created_at: parse_timestamp(
            "created_at",
            &row.try_get::<String, _>("created_at").map_err(storage)?,
        )?,
        expires_at: parse_timestamp(
            "expires_at",
            &row.try_get::<String, _>("expires_at").map_err(storage)?,
        )?,
    })
}

fn parse_amount(column: &str, value: &str) -> Result<Decimal, LedgerError> {
    value
        .parse::<Decimal>()
        .map_err(|error| LedgerError::Storage(format!("invalid decimal in `{column}`: {error}")))
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| LedgerError::Storage(format!("invalid timestamp in `{column}`: {error}")))
}

fn storage(error: sqlx::Error) -> LedgerError {
    LedgerError::Storage(error.to_string())
}

const SELECT_ACCOUNT: &str = "SELECT limit_value, spent, reserved, on_limit
     FROM spending_accounts
     WHERE user_identifier = ?";

const SELECT_RESERVATION: &str =
    "SELECT token, user_identifier, amount, state, created_at, expires_at
     FROM reservations
     WHERE token = ?";

#[async_trait::async_trait]
impl SpendingLedger for SqlSpendingLedger {
    async fn status(&self, user_id: &UserId) -> Result<LedgerStatus, LedgerError> {
        let row = sqlx::query(SELECT_ACCOUNT)
            .bind(&user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        let Some(row) = row else {
            return Err(LedgerError::UnknownUser(user_id.clone()));
        };

        let account = account_from_row(&row)?;
        Ok(LedgerStatus {
            user_id: user_id.clone(),
            limit: account.limit,
            spent: account.spent,
            reserved: account.reserved,
            on_limit: account.on_limit,
        })
    }

    async fn set_limit(
        &self,
        user_id: &UserId,
        limit: Decimal,
        on_limit: OverLimitPolicy,
    ) -> Result<(), LedgerError> {
        validate_limit(limit)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO spending_accounts (
                user_identifier, limit_value, spent, reserved, on_limit, created_at, updated_at
             ) VALUES (?, ?, '0', '0', ?, ?, ?)
             ON CONFLICT(user_identifier) DO UPDATE SET
                limit_value = excluded.limit_value,
                on_limit = excluded.on_limit,
                updated_at = excluded.updated_at",
        )
        .bind(&user_id.0)
        .bind(limit.to_string())
        .bind(on_limit.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn reserve(
        &self,
        user_id: &UserId,
        amount: Decimal,
        ttl: chrono::Duration,
    ) -> Result<Reservation, LedgerError> {
        // The capacity check must read under the write lock. A deferred
        // transaction takes the lock at its first write, and SQLite refuses
        // the read-to-write upgrade when another writer got there first,
        // failing valid reservations with a busy error.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(storage)?;
        let now = Utc::now().to_rfc3339();

        if self.unknown_user_policy == UnknownUserPolicy::Unlimited {
            // Limits are opt-in: a first-time buyer gets an uncapped account
            // row so holds and spend are still recorded.
            let inserted = sqlx::query(
                "INSERT INTO spending_accounts (
                    user_identifier, limit_value, spent, reserved, on_limit, created_at, updated_at
                 ) VALUES (?, NULL, '0', '0', ?, ?, ?)
                 ON CONFLICT(user_identifier) DO NOTHING",
            )
            .bind(&user_id.0)
            .bind(self.default_on_limit.as_str())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

            if inserted.rows_affected() > 0 {
                warn!(user = %user_id, "reserving for a buyer with no spending limit set");
            }
        }

        let row = sqlx::query(SELECT_ACCOUNT)
            .bind(&user_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

        let Some(row) = row else {
            return Err(LedgerError::UnknownUser(user_id.clone()));
        };

        let account = account_from_row(&row)?;
        check_capacity(
            user_id,
            account.limit,
            account.spent,
            account.reserved,
            amount,
            account.on_limit,
        )?;

        let reservation = Reservation::hold(user_id.clone(), amount, ttl);

        sqlx::query(
            "INSERT INTO reservations (token, user_identifier, amount, state, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&reservation.token.0)
        .bind(&user_id.0)
        .bind(reservation.amount.to_string())
        .bind(reservation.state.as_str())
        .bind(reservation.created_at.to_rfc3339())
        .bind(reservation.expires_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            "UPDATE spending_accounts SET reserved = ?, updated_at = ? WHERE user_identifier = ?",
        )
        .bind((account.reserved + amount).to_string())
        .bind(&now)
        .bind(&user_id.0)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(reservation)
    }

    async fn commit(&self, token: &ReservationToken) -> Result<Reservation, LedgerError> {
        self.finalize(token, ReservationState::Committed).await
    }

    async fn release(&self, token: &ReservationToken) -> Result<Reservation, LedgerError> {
        self.finalize(token, ReservationState::Released).await
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(storage)?;

        let rows = sqlx::query(
            "SELECT token, user_identifier, amount, state, created_at, expires_at
             FROM reservations
             WHERE state = 'held' AND expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut swept = 0u64;
        for row in &rows {
            let reservation = reservation_from_row(row)?;
            apply_transition(&mut tx, &reservation, ReservationState::Released).await?;
            swept += 1;
        }

        tx.commit().await.map_err(storage)?;
        Ok(swept)
    }
}

impl SqlSpendingLedger {
    async fn finalize(
        &self,
        token: &ReservationToken,
        target: ReservationState,
    ) -> Result<Reservation, LedgerError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(storage)?;

        let row = sqlx::query(SELECT_RESERVATION)
            .bind(&token.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

        let Some(row) = row else {
            return Err(LedgerError::UnknownReservation(token.clone()));
        };

        let mut reservation = reservation_from_row(&row)?;
        if reservation.state == target {
            // Repeating the same finalization is a no-op so crashed
            // checkouts converge on retry.
            return Ok(reservation);
        }
        if reservation.state != ReservationState::Held {
            return Err(LedgerError::ReservationConsumed {
                token: token.clone(),
                state: reservation.state,
                attempted: match target {
                    ReservationState::Committed => "committed",
                    _ => "released",
                },
            });
        }

        apply_transition(&mut tx, &reservation, target).await?;
        tx.commit().await.map_err(storage)?;

        reservation.state = target;
        Ok(reservation)
    }
}

/// Move a held reservation to a terminal state and adjust the account
/// balances in the same database transaction.
async fn apply_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    reservation: &Reservation,
    target: ReservationState,
) -> Result<(), LedgerError> {
    let row = sqlx::query(SELECT_ACCOUNT)
        .bind(&reservation.user_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage)?;

    let Some(row) = row else {
        return Err(LedgerError::Storage(format!(
            "reservation `{}` references missing account `{}`",
            reservation.token.0, reservation.user_id
        )));
    };

    let account = account_from_row(&row)?;
    let now = Utc::now().to_rfc3339();

    let reserved = (account.reserved - reservation.amount).max(Decimal::ZERO);
    let spent = match target {
        ReservationState::Committed => account.spent + reservation.amount,
        _ => account.spent,
    };

    sqlx::query(
        "UPDATE spending_accounts SET spent = ?, reserved = ?, updated_at = ?
         WHERE user_identifier = ?",
    )
    .bind(spent.to_string())
    .bind(reserved.to_string())
    .bind(&now)
    .bind(&reservation.user_id.0)
    .execute(&mut **tx)
    .await
    .map_err(storage)?;

    sqlx::query("UPDATE reservations SET state = ? WHERE token = ?")
        .bind(target.as_str())
        .bind(&reservation.token.0)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use poltergeist_core::domain::user::{OverLimitPolicy, UnknownUserPolicy, UserId};
    use poltergeist_core::ledger::{LedgerError, ReservationState, SpendingLedger};

    use super::SqlSpendingLedger;
    use crate::{connect_with_settings, migrations};

    async fn ledger() -> SqlSpendingLedger {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        SqlSpendingLedger::new(pool, UnknownUserPolicy::Unlimited, OverLimitPolicy::Confirm)
    }

    fn money(value: &str) -> Decimal {
        value.parse().expect("decimal literal")
    }

    #[tokio::test]
    async fn reserve_commit_moves_hold_into_spend() {
        let ledger = ledger().await;
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("100"), OverLimitPolicy::Confirm).await.expect("set limit");

        let reservation =
            ledger.reserve(&user, money("40"), Duration::minutes(10)).await.expect("reserve");
        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.reserved, money("40"));
        assert_eq!(status.spent, Decimal::ZERO);

        let committed = ledger.commit(&reservation.token).await.expect("commit");
        assert_eq!(committed.state, ReservationState::Committed);

        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.spent, money("40"));
        assert_eq!(status.reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reserve_rejects_when_capacity_exhausted() {
        let ledger = ledger().await;
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("50"), OverLimitPolicy::Reject).await.expect("set limit");

        ledger.reserve(&user, money("30"), Duration::minutes(10)).await.expect("first hold");
        let denied = ledger.reserve(&user, money("30"), Duration::minutes(10)).await;

        match denied {
            Err(LedgerError::LimitExceeded { requested, limit, reserved, on_limit, .. }) => {
                assert_eq!(requested, money("30"));
                assert_eq!(limit, money("50"));
                assert_eq!(reserved, money("30"));
                assert_eq!(on_limit, OverLimitPolicy::Reject);
            }
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_returns_capacity_and_is_idempotent() {
        let ledger = ledger().await;
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("50"), OverLimitPolicy::Confirm).await.expect("set limit");

        let reservation =
            ledger.reserve(&user, money("50"), Duration::minutes(10)).await.expect("reserve");
        ledger.release(&reservation.token).await.expect("release");
        ledger.release(&reservation.token).await.expect("repeat release is a no-op");

        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.reserved, Decimal::ZERO);
        assert_eq!(status.spent, Decimal::ZERO);

        // Capacity is back, so the full amount fits again.
        ledger.reserve(&user, money("50"), Duration::minutes(10)).await.expect("re-reserve");
    }

    #[tokio::test]
    async fn commit_after_release_is_rejected() {
        let ledger = ledger().await;
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("50"), OverLimitPolicy::Confirm).await.expect("set limit");

        let reservation =
            ledger.reserve(&user, money("20"), Duration::minutes(10)).await.expect("reserve");
        ledger.release(&reservation.token).await.expect("release");

        match ledger.commit(&reservation.token).await {
            Err(LedgerError::ReservationConsumed { state, .. }) => {
                assert_eq!(state, ReservationState::Released);
            }
            other => panic!("expected ReservationConsumed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_user_reserves_without_limit_under_unlimited_policy() {
        let ledger = ledger().await;
        let user = UserId("new@example.com".to_string());

        ledger.reserve(&user, money("250"), Duration::minutes(10)).await.expect("reserve");
        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.limit, None);
        assert_eq!(status.reserved, money("250"));
    }

    #[tokio::test]
    async fn unknown_user_is_rejected_under_reject_policy() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let ledger =
            SqlSpendingLedger::new(pool, UnknownUserPolicy::Reject, OverLimitPolicy::Confirm);

        let user = UserId("new@example.com".to_string());
        let result = ledger.reserve(&user, money("10"), Duration::minutes(10)).await;
        assert!(matches!(result, Err(LedgerError::UnknownUser(_))));
    }

    #[tokio::test]
    async fn release_expired_sweeps_only_stale_holds() {
        let ledger = ledger().await;
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("100"), OverLimitPolicy::Confirm).await.expect("set limit");

        let stale =
            ledger.reserve(&user, money("30"), Duration::seconds(-1)).await.expect("stale hold");
        let fresh =
            ledger.reserve(&user, money("20"), Duration::minutes(10)).await.expect("fresh hold");

        let swept = ledger.release_expired(Utc::now()).await.expect("sweep");
        assert_eq!(swept, 1);

        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.reserved, money("20"));

        assert!(matches!(
            ledger.commit(&stale.token).await,
            Err(LedgerError::ReservationConsumed { .. })
        ));
        ledger.commit(&fresh.token).await.expect("fresh hold still commits");
    }
}

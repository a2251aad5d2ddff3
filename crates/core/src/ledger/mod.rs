//! Spending ledger contract.
//!
//! The ledger is the authoritative record of a user's spending limit and
//! cumulative spend. Capacity is handed out through two-phase
//! reserve/commit/release operations so that concurrent checkouts cannot
//! jointly overspend a limit they individually fit under. Implementations
//! live in `poltergeist-db`; the capacity arithmetic is kept pure here so
//! both backends share one decision rule.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::user::{OverLimitPolicy, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken(pub String);

impl ReservationToken {
    pub fn generate() -> Self {
        Self(format!("rsv-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "held" => Some(Self::Held),
            "committed" => Some(Self::Committed),
            "released" => Some(Self::Released),
            _ => None,
        }
    }
}

/// A provisional hold against spending capacity, convertible to a commit or
/// released back. Expired holds are swept by `release_expired`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub token: ReservationToken,
    pub user_id: UserId,
    pub amount: Decimal,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn hold(user_id: UserId, amount: Decimal, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token: ReservationToken::generate(),
            user_id,
            amount,
            state: ReservationState::Held,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Held && now >= self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub user_id: UserId,
    pub limit: Option<Decimal>,
    pub spent: Decimal,
    pub reserved: Decimal,
    pub on_limit: OverLimitPolicy,
}

impl LedgerStatus {
    /// Remaining capacity after both settled spend and outstanding holds.
    /// `None` means unlimited.
    pub fn remaining(&self) -> Option<Decimal> {
        self.limit.map(|limit| limit - self.spent - self.reserved)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("no spending limit has ever been set for user `{0}`")]
    UnknownUser(UserId),
    #[error("spending limit must be non-negative, got {0}")]
    InvalidLimit(Decimal),
    #[error("reservation amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error(
        "reserving {requested} for `{user_id}` exceeds limit {limit} (spent {spent}, reserved {reserved})"
    )]
    LimitExceeded {
        user_id: UserId,
        requested: Decimal,
        limit: Decimal,
        spent: Decimal,
        reserved: Decimal,
        on_limit: OverLimitPolicy,
    },
    #[error("unknown reservation token `{0}`")]
    UnknownReservation(ReservationToken),
    #[error("reservation `{token}` was already {state:?} and cannot be {attempted}")]
    ReservationConsumed { token: ReservationToken, state: ReservationState, attempted: &'static str },
    #[error("ledger storage failure: {0}")]
    Storage(String),
}

/// Validate a limit value supplied by a user. `Decimal` is always finite,
/// so only the sign needs checking.
pub fn validate_limit(limit: Decimal) -> Result<(), LedgerError> {
    if limit.is_sign_negative() {
        return Err(LedgerError::InvalidLimit(limit));
    }
    Ok(())
}

/// The single capacity rule both ledger backends apply inside their atomic
/// section: a reservation fits iff `spent + reserved + amount <= limit`.
pub fn check_capacity(
    user_id: &UserId,
    limit: Option<Decimal>,
    spent: Decimal,
    reserved: Decimal,
    amount: Decimal,
    on_limit: OverLimitPolicy,
) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(amount));
    }

    let Some(limit) = limit else {
        return Ok(());
    };

    if spent + reserved + amount > limit {
        return Err(LedgerError::LimitExceeded {
            user_id: user_id.clone(),
            requested: amount,
            limit,
            spent,
            reserved,
            on_limit,
        });
    }

    Ok(())
}

/// Durable per-user spend accounting with two-phase reservations.
///
/// All monetary transitions are idempotent: re-committing a committed token
/// or re-releasing a released one is a no-op returning the stored
/// reservation, so a crashed orchestration converges when retried. Crossing
/// operations (commit after release or vice versa) surface
/// [`LedgerError::ReservationConsumed`].
#[async_trait]
pub trait SpendingLedger: Send + Sync {
    /// Current limit/spent/reserved for a user. `UnknownUser` if no limit
    /// has ever been set.
    async fn status(&self, user_id: &UserId) -> Result<LedgerStatus, LedgerError>;

    /// Create or overwrite the user's limit and over-limit policy. Does not
    /// retroactively invalidate settled spend.
    async fn set_limit(
        &self,
        user_id: &UserId,
        limit: Decimal,
        on_limit: OverLimitPolicy,
    ) -> Result<(), LedgerError>;

    /// Atomically check capacity and place a hold that expires after `ttl`.
    async fn reserve(
        &self,
        user_id: &UserId,
        amount: Decimal,
        ttl: Duration,
    ) -> Result<Reservation, LedgerError>;

    /// Move a held amount into settled spend.
    async fn commit(&self, token: &ReservationToken) -> Result<Reservation, LedgerError>;

    /// Cancel a hold, returning its amount to capacity.
    async fn release(&self, token: &ReservationToken) -> Result<Reservation, LedgerError>;

    /// Release every held reservation whose TTL has elapsed; returns how
    /// many were swept.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError>;
}

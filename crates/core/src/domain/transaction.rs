use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::cart::CartId;
use crate::domain::user::UserId;
use crate::errors::DomainError;
use crate::ledger::ReservationToken;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(format!("txn-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The audit record of one checkout attempt.
///
/// Created with status `Pending` *before* the irreversible provider call and
/// moved to `Succeeded`/`Failed` afterwards; that ordering is what makes a
/// partial failure auditable. The `prev_hash`/`entry_hash`/`signature`
/// fields chain the record into the user's purchase history (see
/// [`crate::history::ChainSigner`]); they cover only the immutable identity
/// of the attempt, so the later status update does not invalidate the chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub cart_id: CartId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub reservation_token: ReservationToken,
    pub receipt_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub prev_hash: Option<String>,
    pub entry_hash: Option<String>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn pending(
        cart_id: CartId,
        user_id: UserId,
        amount: Decimal,
        currency: impl Into<String>,
        reservation_token: ReservationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::generate(),
            cart_id,
            user_id,
            amount,
            currency: currency.into(),
            status: TransactionStatus::Pending,
            reservation_token,
            receipt_ref: None,
            failure_reason: None,
            prev_hash: None,
            entry_hash: None,
            signature: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_succeeded(&mut self, receipt_ref: impl Into<String>) -> Result<(), DomainError> {
        self.transition_to(TransactionStatus::Succeeded)?;
        self.receipt_ref = Some(receipt_ref.into());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        self.transition_to(TransactionStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    fn transition_to(&mut self, next: TransactionStatus) -> Result<(), DomainError> {
        // Pending is the only non-terminal state; a settled transaction is
        // never re-entered.
        if self.status != TransactionStatus::Pending || next == TransactionStatus::Pending {
            return Err(DomainError::InvalidTransactionTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

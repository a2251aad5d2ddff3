//! Checkout orchestration contract.
//!
//! Defines the per-attempt state machine, the retry schedule, and the seam
//! to the external commerce provider. The async coordinator that drives
//! these lives in `poltergeist-agent`; keeping the transition table and
//! backoff arithmetic pure makes every branch unit-testable without a
//! provider.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::cart::{Cart, CartId, CartStatus};
use crate::domain::transaction::Transaction;
use crate::domain::user::UserId;
use crate::ledger::LedgerError;

/// States of a single checkout attempt.
///
/// Everything before `Submitted` is reversible; submission is the one
/// externally-irreversible step, so the reservation and the pending
/// transaction record must both exist before it and the terminal states
/// are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    Initiated,
    Reserved,
    Submitted,
    Succeeded,
    Failed,
}

impl CheckoutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Reserved => "reserved",
            Self::Submitted => "submitted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Reserved)
                | (Self::Initiated, Self::Failed)
                | (Self::Reserved, Self::Submitted)
                | (Self::Reserved, Self::Failed)
                // Submitted loops on itself across retry attempts.
                | (Self::Submitted, Self::Submitted)
                | (Self::Submitted, Self::Succeeded)
                | (Self::Submitted, Self::Failed)
        )
    }
}

/// Tunables for the coordinator. Defaults follow the orchestration design:
/// three submission attempts, 30 s submit timeout, 10 minute reservation
/// TTL.
#[derive(Clone, Debug)]
pub struct CheckoutConfig {
    pub max_attempts: u32,
    pub submit_timeout_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
    pub reservation_ttl_secs: i64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            submit_timeout_secs: 30,
            retry_base_delay_ms: 500,
            retry_backoff_multiplier: 2,
            reservation_ttl_secs: 600,
        }
    }
}

/// Exponential backoff between submission attempts. Attempts are numbered
/// from 1; the delay is applied after a failed attempt, so attempt `n`
/// waits `base * multiplier^(n-1)`.
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    base_delay_ms: u64,
    multiplier: u32,
}

impl RetrySchedule {
    pub fn new(base_delay_ms: u64, multiplier: u32) -> Self {
        Self { base_delay_ms, multiplier }
    }

    pub fn from_config(config: &CheckoutConfig) -> Self {
        Self::new(config.retry_base_delay_ms, config.retry_backoff_multiplier)
    }

    pub fn delay_after_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        std::time::Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Buyer details forwarded to the provider at submission. The email doubles
/// as the ledger user identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerInfo {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub address_line1: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl BuyerInfo {
    pub fn user_id(&self) -> UserId {
        UserId(self.email.clone())
    }
}

/// What the provider hands back for a successful checkout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub reference: String,
    pub raw: serde_json::Value,
}

/// Failures crossing the provider seam. `Unavailable` is the only transient
/// class; the coordinator retries it inside its attempt budget. Everything
/// else is permanent for the current call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("commerce provider unavailable: {0}")]
    Unavailable(String),
    #[error("checkout declined by provider: {0}")]
    Declined(String),
    #[error("cart `{0}` not found at provider")]
    CartNotFound(String),
    #[error("product `{0}` not found at provider")]
    ProductNotFound(String),
    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// The seam to the external commerce API, as seen by the coordinator.
/// Implemented by the Rye client in `poltergeist-commerce` and by fakes in
/// tests.
#[async_trait]
pub trait CommerceProvider: Send + Sync {
    async fn fetch_cart(&self, cart_id: &CartId) -> Result<Cart, ProviderError>;

    /// The single externally-irreversible operation in the system.
    async fn submit_checkout(
        &self,
        cart_id: &CartId,
        buyer: &BuyerInfo,
    ) -> Result<ProviderReceipt, ProviderError>;
}

/// Surfaced when a checkout would exceed the limit and the user's policy
/// asks for confirmation instead of a hard failure. No transaction is
/// recorded and no money is held at this point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequired {
    pub user_id: UserId,
    pub cart_id: CartId,
    pub amount: Decimal,
    pub currency: String,
    pub limit: Decimal,
    pub spent: Decimal,
    pub reserved: Decimal,
}

/// Terminal result of a coordinated checkout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Provider accepted; funds committed, transaction succeeded.
    Completed { transaction: Transaction },
    /// Over-limit under a `confirm` policy; the caller must decide.
    NeedsConfirmation { confirmation: ConfirmationRequired },
    /// Provider permanently declined; reservation released, not retried.
    Declined { transaction: Transaction, reason: String },
    /// Attempt budget exhausted on transient failures. The outcome at the
    /// provider is unknown; the caller should verify against purchase
    /// history and the provider receipt before retrying.
    Incomplete { transaction: Transaction, attempts: u32 },
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CheckoutError {
    #[error("cart `{0}` not found")]
    CartNotFound(CartId),
    #[error("cart `{cart_id}` is {status:?}, not open for checkout")]
    CartNotOpen { cart_id: CartId, status: CartStatus },
    #[error("buyer info must include an email address")]
    MissingBuyerEmail,
    #[error(transparent)]
    Domain(#[from] crate::errors::DomainError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("commerce provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("history storage failure: {0}")]
    History(String),
}

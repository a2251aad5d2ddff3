pub mod checkout;
pub mod config;
pub mod domain;
pub mod errors;
pub mod history;
pub mod ledger;

pub use checkout::{
    BuyerInfo, CheckoutConfig, CheckoutError, CheckoutOutcome, CheckoutState, CommerceProvider,
    ConfirmationRequired, ProviderError, ProviderReceipt, RetrySchedule,
};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::cart::{Cart, CartId, CartLine, CartStatus};
pub use domain::product::{Product, ProductCandidate, ProductId};
pub use domain::transaction::{Transaction, TransactionId, TransactionStatus};
pub use domain::user::{OverLimitPolicy, UnknownUserPolicy, UserId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use history::{ChainSigner, ChainVerification};
pub use ledger::{
    LedgerError, LedgerStatus, Reservation, ReservationState, ReservationToken, SpendingLedger,
};

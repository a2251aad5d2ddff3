use async_trait::async_trait;
use thiserror::Error;

use poltergeist_core::domain::cart::{Cart, CartId};
use poltergeist_core::domain::transaction::Transaction;
use poltergeist_core::domain::user::UserId;
use poltergeist_core::ledger::LedgerError;

pub mod cart;
pub mod ledger;
pub mod memory;
pub mod transaction;

pub use cart::SqlCartSnapshotRepository;
pub use ledger::SqlSpendingLedger;
pub use memory::{
    InMemoryCartSnapshotRepository, InMemorySpendingLedger, InMemoryTransactionRepository,
};
pub use transaction::SqlTransactionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for LedgerError {
    fn from(error: RepositoryError) -> Self {
        LedgerError::Storage(error.to_string())
    }
}

/// Append-only purchase record. `append` inserts a new row exactly once;
/// `settle` may only touch the status columns of an existing row.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Most recent transaction for a user, by creation time. Feeds the
    /// previous-hash link when sealing a new entry.
    async fn latest_for_user(&self, user_id: &UserId)
        -> Result<Option<Transaction>, RepositoryError>;

    async fn append(&self, transaction: Transaction) -> Result<(), RepositoryError>;

    /// Persist a status change (succeeded/failed plus receipt or reason).
    /// Every other column is left untouched.
    async fn settle(&self, transaction: &Transaction) -> Result<(), RepositoryError>;

    /// Most-recent-first listing, capped at `limit` entries.
    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<Transaction>, RepositoryError>;
}

#[async_trait]
pub trait CartSnapshotRepository: Send + Sync {
    async fn find_by_id(&self, id: &CartId) -> Result<Option<Cart>, RepositoryError>;
    async fn save(&self, cart: Cart) -> Result<(), RepositoryError>;
}

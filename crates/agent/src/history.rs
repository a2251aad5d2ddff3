use std::sync::Arc;

use thiserror::Error;

use poltergeist_core::domain::transaction::Transaction;
use poltergeist_core::domain::user::UserId;
use poltergeist_core::errors::DomainError;
use poltergeist_core::history::{ChainSigner, ChainVerification};
use poltergeist_db::repositories::{RepositoryError, TransactionRepository};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("history storage failure: {0}")]
    Storage(#[from] RepositoryError),
}

/// Read side of the purchase record: recent purchases and chain
/// verification. Writing happens in the checkout coordinator.
pub struct PurchaseHistory {
    transactions: Arc<dyn TransactionRepository>,
    signer: ChainSigner,
    default_list_limit: u32,
}

impl PurchaseHistory {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        signer: ChainSigner,
        default_list_limit: u32,
    ) -> Self {
        Self { transactions, signer, default_list_limit }
    }

    /// Most-recent-first listing. `limit` defaults to the configured value
    /// and must be positive.
    pub async fn list(
        &self,
        user_id: &UserId,
        limit: Option<i64>,
    ) -> Result<Vec<Transaction>, HistoryError> {
        let limit = match limit {
            None => self.default_list_limit,
            Some(value) => u32::try_from(value)
                .ok()
                .filter(|value| *value > 0)
                .ok_or(DomainError::InvalidHistoryLimit(value))?,
        };

        Ok(self.transactions.list_for_user(user_id, limit).await?)
    }

    /// Re-derive the user's whole hash chain oldest-first.
    pub async fn verify(&self, user_id: &UserId) -> Result<ChainVerification, HistoryError> {
        let mut entries = self.transactions.list_for_user(user_id, u32::MAX).await?;
        entries.reverse();
        Ok(self.signer.verify(user_id, &entries))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use poltergeist_core::domain::cart::CartId;
    use poltergeist_core::domain::transaction::Transaction;
    use poltergeist_core::domain::user::UserId;
    use poltergeist_core::errors::DomainError;
    use poltergeist_core::history::ChainSigner;
    use poltergeist_core::ledger::ReservationToken;
    use poltergeist_db::repositories::{InMemoryTransactionRepository, TransactionRepository};

    use super::{HistoryError, PurchaseHistory};

    async fn seeded_history(count: i64) -> PurchaseHistory {
        let repository = Arc::new(InMemoryTransactionRepository::default());
        let signer = ChainSigner::new("test-key");

        let mut prev_hash = None;
        for index in 0..count {
            let mut transaction = Transaction::pending(
                CartId(format!("cart-{index}")),
                UserId("buyer@example.com".to_string()),
                Decimal::new(10_00, 2),
                "USD",
                ReservationToken::generate(),
            );
            transaction.created_at += chrono::Duration::seconds(index);
            signer.seal(&mut transaction, prev_hash.clone());
            prev_hash = transaction.entry_hash.clone();
            repository.append(transaction).await.expect("append");
        }

        PurchaseHistory::new(repository, ChainSigner::new("test-key"), 10)
    }

    #[tokio::test]
    async fn default_limit_caps_listing_at_ten() {
        let history = seeded_history(12).await;
        let user = UserId("buyer@example.com".to_string());

        let listed = history.list(&user, None).await.expect("list");
        assert_eq!(listed.len(), 10);
        assert_eq!(listed[0].cart_id.0, "cart-11");
    }

    #[tokio::test]
    async fn non_positive_limit_is_rejected() {
        let history = seeded_history(1).await;
        let user = UserId("buyer@example.com".to_string());

        assert!(matches!(
            history.list(&user, Some(0)).await,
            Err(HistoryError::Domain(DomainError::InvalidHistoryLimit(0)))
        ));
        assert!(matches!(
            history.list(&user, Some(-5)).await,
            Err(HistoryError::Domain(DomainError::InvalidHistoryLimit(-5)))
        ));
    }

    #[tokio::test]
    async fn verify_walks_full_chain() {
        let history = seeded_history(4).await;
        let user = UserId("buyer@example.com".to_string());

        let verification = history.verify(&user).await.expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.verified_entries, 4);
    }
}

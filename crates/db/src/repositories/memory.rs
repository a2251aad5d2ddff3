use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

use poltergeist_core::domain::cart::{Cart, CartId};
use poltergeist_core::domain::transaction::Transaction;
use poltergeist_core::domain::user::{OverLimitPolicy, UnknownUserPolicy, UserId};
use poltergeist_core::ledger::{
    check_capacity, validate_limit, LedgerError, LedgerStatus, Reservation, ReservationState,
    ReservationToken, SpendingLedger,
};

use super::{CartSnapshotRepository, RepositoryError, TransactionRepository};

#[derive(Clone)]
struct AccountState {
    limit: Option<Decimal>,
    spent: Decimal,
    reserved: Decimal,
    on_limit: OverLimitPolicy,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, AccountState>,
    reservations: HashMap<String, Reservation>,
}

/// Test and demo double for [`SqlSpendingLedger`]. One mutex around the
/// whole state gives the same atomicity as the database transaction.
///
/// [`SqlSpendingLedger`]: super::SqlSpendingLedger
pub struct InMemorySpendingLedger {
    state: Mutex<LedgerState>,
    unknown_user_policy: UnknownUserPolicy,
    default_on_limit: OverLimitPolicy,
}

impl InMemorySpendingLedger {
    pub fn new(unknown_user_policy: UnknownUserPolicy, default_on_limit: OverLimitPolicy) -> Self {
        Self { state: Mutex::new(LedgerState::default()), unknown_user_policy, default_on_limit }
    }
}

impl Default for InMemorySpendingLedger {
    fn default() -> Self {
        Self::new(UnknownUserPolicy::Unlimited, OverLimitPolicy::Confirm)
    }
}

#[async_trait::async_trait]
impl SpendingLedger for InMemorySpendingLedger {
    async fn status(&self, user_id: &UserId) -> Result<LedgerStatus, LedgerError> {
        let state = self.state.lock().await;
        let account =
            state.accounts.get(&user_id.0).ok_or_else(|| LedgerError::UnknownUser(user_id.clone()))?;

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

        let mut state = self.state.lock().await;
        let account = state.accounts.entry(user_id.0.clone()).or_insert(AccountState {
            limit: None,
            spent: Decimal::ZERO,
            reserved: Decimal::ZERO,
            on_limit,
        });
        account.limit = Some(limit);
        account.on_limit = on_limit;
        Ok(())
    }

    async fn reserve(
        &self,
        user_id: &UserId,
        amount: Decimal,
        ttl: chrono::Duration,
    ) -> Result<Reservation, LedgerError> {
        let mut state = self.state.lock().await;

        if !state.accounts.contains_key(&user_id.0) {
            if self.unknown_user_policy == UnknownUserPolicy::Reject {
                return Err(LedgerError::UnknownUser(user_id.clone()));
            }
            state.accounts.insert(
                user_id.0.clone(),
                AccountState {
                    limit: None,
                    spent: Decimal::ZERO,
                    reserved: Decimal::ZERO,
                    on_limit: self.default_on_limit,
                },
            );
        }

        let account = state
            .accounts
            .get(&user_id.0)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownUser(user_id.clone()))?;

        check_capacity(
            user_id,
            account.limit,
            account.spent,
            account.reserved,
            amount,
            account.on_limit,
        )?;

        let reservation = Reservation::hold(user_id.clone(), amount, ttl);
        state.reservations.insert(reservation.token.0.clone(), reservation.clone());
        if let Some(account) = state.accounts.get_mut(&user_id.0) {
            account.reserved += amount;
        }

        Ok(reservation)
    }

    async fn commit(&self, token: &ReservationToken) -> Result<Reservation, LedgerError> {
        self.finalize(token, ReservationState::Committed).await
    }

    async fn release(&self, token: &ReservationToken) -> Result<Reservation, LedgerError> {
        self.finalize(token, ReservationState::Released).await
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut state = self.state.lock().await;

        let expired: Vec<String> = state
            .reservations
            .values()
            .filter(|reservation| reservation.is_expired(now))
            .map(|reservation| reservation.token.0.clone())
            .collect();

        for token in &expired {
            if let Some(reservation) = state.reservations.get(token).cloned() {
                if let Some(account) = state.accounts.get_mut(&reservation.user_id.0) {
                    account.reserved = (account.reserved - reservation.amount).max(Decimal::ZERO);
                }
                if let Some(stored) = state.reservations.get_mut(token) {
                    stored.state = ReservationState::Released;
                }
            }
        }

        Ok(expired.len() as u64)
    }
}

impl InMemorySpendingLedger {
    async fn finalize(
        &self,
        token: &ReservationToken,
        target: ReservationState,
    ) -> Result<Reservation, LedgerError> {
        let mut state = self.state.lock().await;

        let reservation = state
            .reservations
            .get(&token.0)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownReservation(token.clone()))?;

        if reservation.state == target {
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

        if let Some(account) = state.accounts.get_mut(&reservation.user_id.0) {
            account.reserved = (account.reserved - reservation.amount).max(Decimal::ZERO);
            if target == ReservationState::Committed {
                account.spent += reservation.amount;
            }
        }

        let stored = state
            .reservations
            .get_mut(&token.0)
            .ok_or_else(|| LedgerError::UnknownReservation(token.clone()))?;
        stored.state = target;
        Ok(stored.clone())
    }
}

#[derive(Default)]
pub struct InMemoryTransactionRepository {
    transactions: RwLock<Vec<Transaction>>,
}

#[async_trait::async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn latest_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .iter()
            .filter(|transaction| &transaction.user_id == user_id)
            .max_by_key(|transaction| (transaction.created_at, transaction.id.0.clone()))
            .cloned())
    }

    async fn append(&self, transaction: Transaction) -> Result<(), RepositoryError> {
        let mut transactions = self.transactions.write().await;
        if transactions.iter().any(|existing| existing.id == transaction.id) {
            return Err(RepositoryError::Decode(format!(
                "duplicate transaction id `{}`",
                transaction.id.0
            )));
        }
        transactions.push(transaction);
        Ok(())
    }

    async fn settle(&self, transaction: &Transaction) -> Result<(), RepositoryError> {
        let mut transactions = self.transactions.write().await;
        let stored = transactions
            .iter_mut()
            .find(|existing| existing.id == transaction.id)
            .ok_or_else(|| {
                RepositoryError::Decode(format!(
                    "settle targeted unknown transaction `{}`",
                    transaction.id.0
                ))
            })?;

        stored.status = transaction.status;
        stored.receipt_ref = transaction.receipt_ref.clone();
        stored.failure_reason = transaction.failure_reason.clone();
        stored.updated_at = transaction.updated_at;
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<Transaction>, RepositoryError> {
        let transactions = self.transactions.read().await;
        let mut matching: Vec<Transaction> = transactions
            .iter()
            .filter(|transaction| &transaction.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (b.created_at, &b.id.0).cmp(&(a.created_at, &a.id.0))
        });
        matching.truncate(limit as usize);
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryCartSnapshotRepository {
    carts: RwLock<HashMap<String, Cart>>,
}

#[async_trait::async_trait]
impl CartSnapshotRepository for InMemoryCartSnapshotRepository {
    async fn find_by_id(&self, id: &CartId) -> Result<Option<Cart>, RepositoryError> {
        let carts = self.carts.read().await;
        Ok(carts.get(&id.0).cloned())
    }

    async fn save(&self, cart: Cart) -> Result<(), RepositoryError> {
        let mut carts = self.carts.write().await;
        carts.insert(cart.id.0.clone(), cart);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use rust_decimal::Decimal;

    use poltergeist_core::domain::user::{OverLimitPolicy, UserId};
    use poltergeist_core::ledger::{LedgerError, SpendingLedger};

    use super::InMemorySpendingLedger;

    fn money(value: &str) -> Decimal {
        value.parse().expect("decimal literal")
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversubscribe() {
        let ledger = Arc::new(InMemorySpendingLedger::default());
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("100"), OverLimitPolicy::Reject).await.expect("set limit");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = Arc::clone(&ledger);
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                ledger.reserve(&user, money("30"), Duration::minutes(10)).await
            }));
        }

        let mut granted = 0;
        let mut denied = 0;
        for handle in handles {
            match handle.await.expect("task") {
                Ok(_) => granted += 1,
                Err(LedgerError::LimitExceeded { .. }) => denied += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        // 100 / 30 leaves room for exactly three holds, no matter how the
        // tasks interleave.
        assert_eq!(granted, 3);
        assert_eq!(denied, 7);

        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.reserved, money("90"));
        assert!(status.spent + status.reserved <= money("100"));
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let ledger = InMemorySpendingLedger::default();
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("100"), OverLimitPolicy::Confirm).await.expect("set limit");

        let reservation =
            ledger.reserve(&user, money("40"), Duration::minutes(10)).await.expect("reserve");
        ledger.commit(&reservation.token).await.expect("commit");
        ledger.commit(&reservation.token).await.expect("repeat commit is a no-op");

        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.spent, money("40"));
        assert_eq!(status.reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn release_after_commit_is_rejected() {
        let ledger = InMemorySpendingLedger::default();
        let user = UserId("buyer@example.com".to_string());
        ledger.set_limit(&user, money("100"), OverLimitPolicy::Confirm).await.expect("set limit");

        let reservation =
            ledger.reserve(&user, money("40"), Duration::minutes(10)).await.expect("reserve");
        ledger.commit(&reservation.token).await.expect("commit");

        assert!(matches!(
            ledger.release(&reservation.token).await,
            Err(LedgerError::ReservationConsumed { .. })
        ));
    }
}

//! Checkout orchestration.
//!
//! Drives a cart through reserve, submit, and settle. The invariant the
//! whole flow protects: money is held in the ledger and a pending
//! transaction row exists before the provider is asked to do anything
//! irreversible, so every crash window leaves evidence that points at the
//! right recovery action.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use poltergeist_core::checkout::{
    BuyerInfo, CheckoutConfig, CheckoutError, CheckoutOutcome, CommerceProvider,
    ConfirmationRequired, ProviderError, RetrySchedule,
};
use poltergeist_core::domain::cart::{Cart, CartId, CartStatus};
use poltergeist_core::domain::transaction::Transaction;
use poltergeist_core::domain::user::OverLimitPolicy;
use poltergeist_core::history::ChainSigner;
use poltergeist_core::ledger::{LedgerError, Reservation, SpendingLedger};
use poltergeist_db::repositories::{CartSnapshotRepository, TransactionRepository};

pub struct CheckoutCoordinator {
    provider: Arc<dyn CommerceProvider>,
    ledger: Arc<dyn SpendingLedger>,
    transactions: Arc<dyn TransactionRepository>,
    snapshots: Arc<dyn CartSnapshotRepository>,
    signer: ChainSigner,
    config: CheckoutConfig,
}

impl CheckoutCoordinator {
    pub fn new(
        provider: Arc<dyn CommerceProvider>,
        ledger: Arc<dyn SpendingLedger>,
        transactions: Arc<dyn TransactionRepository>,
        snapshots: Arc<dyn CartSnapshotRepository>,
        signer: ChainSigner,
        config: CheckoutConfig,
    ) -> Self {
        Self { provider, ledger, transactions, snapshots, signer, config }
    }

    pub async fn checkout(
        &self,
        cart_id: &CartId,
        buyer: &BuyerInfo,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        if buyer.email.trim().is_empty() {
            return Err(CheckoutError::MissingBuyerEmail);
        }
        let user_id = buyer.user_id();

        let cart = self.load_open_cart(cart_id).await?;
        let amount = cart.subtotal;
        let currency = cart.currency.clone();

        let reservation = match self
            .ledger
            .reserve(&user_id, amount, chrono::Duration::seconds(self.config.reservation_ttl_secs))
            .await
        {
            Ok(reservation) => reservation,
            Err(LedgerError::LimitExceeded {
                user_id,
                requested,
                limit,
                spent,
                reserved,
                on_limit,
            }) if on_limit == OverLimitPolicy::Confirm => {
                info!(%user_id, %requested, %limit, "checkout paused for confirmation");
                return Ok(CheckoutOutcome::NeedsConfirmation {
                    confirmation: ConfirmationRequired {
                        user_id,
                        cart_id: cart_id.clone(),
                        amount: requested,
                        currency,
                        limit,
                        spent,
                        reserved,
                    },
                });
            }
            Err(error) => return Err(error.into()),
        };

        // The pending record goes in before submission. If we crash after
        // this point the hold and the row together show an attempt was in
        // flight.
        let mut transaction = Transaction::pending(
            cart_id.clone(),
            user_id.clone(),
            amount,
            currency,
            reservation.token.clone(),
        );
        let prev_hash = self
            .transactions
            .latest_for_user(&user_id)
            .await
            .map_err(|error| CheckoutError::History(error.to_string()))?
            .and_then(|previous| previous.entry_hash);
        self.signer.seal(&mut transaction, prev_hash);

        if let Err(error) = self.transactions.append(transaction.clone()).await {
            self.release_quietly(&reservation, "pending record could not be written").await;
            return Err(CheckoutError::History(error.to_string()));
        }

        self.submit_with_retries(cart, buyer, reservation, transaction).await
    }

    async fn load_open_cart(&self, cart_id: &CartId) -> Result<Cart, CheckoutError> {
        let cart = match self.provider.fetch_cart(cart_id).await {
            Ok(cart) => cart,
            Err(ProviderError::CartNotFound(_)) => {
                return Err(CheckoutError::CartNotFound(cart_id.clone()))
            }
            Err(error) => return Err(error.into()),
        };

        // The provider keeps serving purchased carts as if they were open;
        // our snapshot is authoritative for the lifecycle.
        if let Some(snapshot) = self
            .snapshots
            .find_by_id(cart_id)
            .await
            .map_err(|error| CheckoutError::History(error.to_string()))?
        {
            if snapshot.status != CartStatus::Open {
                return Err(CheckoutError::CartNotOpen {
                    cart_id: cart_id.clone(),
                    status: snapshot.status,
                });
            }
        }

        Ok(cart)
    }

    async fn submit_with_retries(
        &self,
        cart: Cart,
        buyer: &BuyerInfo,
        reservation: Reservation,
        mut transaction: Transaction,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let schedule = RetrySchedule::from_config(&self.config);
        let submit_timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let result =
                match tokio::time::timeout(submit_timeout, self.provider.submit_checkout(&cart.id, buyer))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Unavailable(format!(
                        "submission timed out after {}s",
                        self.config.submit_timeout_secs
                    ))),
                };

            match result {
                Ok(receipt) => {
                    // The provider has already taken the money. Failing the
                    // call now would hide a spend that happened, so local
                    // bookkeeping errors are logged for reconciliation and
                    // the receipt is still returned.
                    if let Err(error) = self.ledger.commit(&reservation.token).await {
                        warn!(
                            token = %reservation.token.0,
                            %error,
                            "failed to commit hold after submission; amount stays held until reconciled"
                        );
                    }
                    transaction.mark_succeeded(receipt.reference.clone())?;
                    if let Err(error) = self.transactions.settle(&transaction).await {
                        warn!(
                            transaction_id = %transaction.id.0,
                            %error,
                            "failed to settle transaction record after submission"
                        );
                    }
                    self.mark_cart_checked_out(cart).await;

                    info!(
                        transaction_id = %transaction.id.0,
                        receipt = %receipt.reference,
                        attempts,
                        "checkout completed"
                    );
                    return Ok(CheckoutOutcome::Completed { transaction });
                }
                Err(error) if error.is_transient() && attempts < self.config.max_attempts => {
                    warn!(
                        cart_id = %cart.id,
                        attempt = attempts,
                        %error,
                        "transient submission failure, will retry"
                    );
                    tokio::time::sleep(schedule.delay_after_attempt(attempts)).await;
                }
                Err(error) if error.is_transient() => {
                    // Budget exhausted. The provider-side outcome is
                    // unknown; release the hold and flag the attempt so a
                    // human can reconcile against the provider.
                    self.release_quietly(&reservation, "attempt budget exhausted").await;
                    transaction.mark_failed(format!(
                        "incomplete after {attempts} attempts: {error}"
                    ))?;
                    self.transactions
                        .settle(&transaction)
                        .await
                        .map_err(|error| CheckoutError::History(error.to_string()))?;

                    warn!(cart_id = %cart.id, attempts, "checkout incomplete");
                    return Ok(CheckoutOutcome::Incomplete { transaction, attempts });
                }
                Err(error) => {
                    let reason = error.to_string();
                    self.release_quietly(&reservation, "provider declined").await;
                    transaction.mark_failed(reason.clone())?;
                    self.transactions
                        .settle(&transaction)
                        .await
                        .map_err(|error| CheckoutError::History(error.to_string()))?;

                    info!(cart_id = %cart.id, %reason, "checkout declined");
                    return Ok(CheckoutOutcome::Declined { transaction, reason });
                }
            }
        }
    }

    async fn mark_cart_checked_out(&self, mut cart: Cart) {
        if cart.transition_to(CartStatus::CheckedOut).is_ok() {
            if let Err(error) = self.snapshots.save(cart).await {
                // The purchase itself succeeded; a stale snapshot only
                // weakens the double-purchase guard, so log and move on.
                warn!(%error, "failed to persist checked-out cart snapshot");
            }
        }
    }

    async fn release_quietly(&self, reservation: &Reservation, context: &str) {
        if let Err(error) = self.ledger.release(&reservation.token).await {
            warn!(token = %reservation.token.0, %error, context, "failed to release reservation");
        }
    }
}

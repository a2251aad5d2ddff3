use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use poltergeist_core::domain::cart::{Cart, CartId, CartStatus};
use poltergeist_core::domain::product::ProductId;
use poltergeist_core::errors::DomainError;
use poltergeist_db::repositories::{CartSnapshotRepository, RepositoryError};

use crate::error::CommerceError;
use crate::rye::RyeClient;

/// The provider-side cart operations the manager needs. [`RyeClient`] is
/// the production implementation.
#[async_trait]
pub trait CartBackend: Send + Sync {
    async fn create_cart(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<Cart, CommerceError>;

    async fn cart_details(&self, cart_id: &CartId) -> Result<Cart, CommerceError>;
}

#[async_trait]
impl CartBackend for RyeClient {
    async fn create_cart(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<Cart, CommerceError> {
        RyeClient::create_cart(self, product_id, quantity).await
    }

    async fn cart_details(&self, cart_id: &CartId) -> Result<Cart, CommerceError> {
        RyeClient::cart_details(self, cart_id).await
    }
}

#[derive(Debug, Error)]
pub enum CartError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Commerce(#[from] CommerceError),
    #[error("cart snapshot storage failure: {0}")]
    Storage(#[from] RepositoryError),
}

/// Cart lifecycle on top of the provider. The provider owns cart contents;
/// the local snapshot owns the open/checked_out status, because the
/// provider keeps serving carts that have already been purchased here.
pub struct CartManager {
    backend: Arc<dyn CartBackend>,
    snapshots: Arc<dyn CartSnapshotRepository>,
}

impl CartManager {
    pub fn new(backend: Arc<dyn CartBackend>, snapshots: Arc<dyn CartSnapshotRepository>) -> Self {
        Self { backend, snapshots }
    }

    pub async fn create_cart(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<Cart, CartError> {
        let quantity =
            u32::try_from(quantity).ok().filter(|value| *value > 0).ok_or(DomainError::InvalidQuantity(quantity))?;

        let cart = self.backend.create_cart(product_id, quantity).await?;
        self.snapshots.save(cart.clone()).await?;

        info!(cart_id = %cart.id, %product_id, quantity, "cart created");
        Ok(cart)
    }

    pub async fn get_cart(&self, cart_id: &CartId) -> Result<Cart, CartError> {
        let mut cart = self.backend.cart_details(cart_id).await?;

        if let Some(snapshot) = self.snapshots.find_by_id(cart_id).await? {
            if snapshot.status != CartStatus::Open {
                cart.status = snapshot.status;
                return Ok(cart);
            }
        }

        // Still open: keep the snapshot current with the provider's view.
        self.snapshots.save(cart.clone()).await?;
        Ok(cart)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    use poltergeist_core::domain::cart::{Cart, CartId, CartLine, CartStatus};
    use poltergeist_core::domain::product::ProductId;
    use poltergeist_core::errors::DomainError;
    use poltergeist_db::repositories::{CartSnapshotRepository, InMemoryCartSnapshotRepository};

    use super::{CartBackend, CartError, CartManager};
    use crate::error::CommerceError;

    struct FakeBackend {
        cart: Mutex<Option<Cart>>,
    }

    impl FakeBackend {
        fn with_cart(cart: Cart) -> Self {
            Self { cart: Mutex::new(Some(cart)) }
        }
    }

    #[async_trait]
    impl CartBackend for FakeBackend {
        async fn create_cart(
            &self,
            _product_id: &ProductId,
            _quantity: u32,
        ) -> Result<Cart, CommerceError> {
            self.cart
                .lock()
                .await
                .clone()
                .ok_or_else(|| CommerceError::MissingData("no cart configured".to_string()))
        }

        async fn cart_details(&self, cart_id: &CartId) -> Result<Cart, CommerceError> {
            let cart = self.cart.lock().await.clone();
            cart.filter(|cart| &cart.id == cart_id).ok_or_else(|| CommerceError::Store {
                code: "CART_NOT_FOUND".to_string(),
                message: format!("cart `{cart_id}` not found"),
            })
        }
    }

    fn sample_cart() -> Cart {
        Cart {
            id: CartId("cart-1".to_string()),
            lines: vec![CartLine {
                product_id: ProductId("B07H1V6RMC".to_string()),
                title: "Anker USB-C Cable".to_string(),
                quantity: 1,
                unit_price: Decimal::new(13_99, 2),
            }],
            subtotal: Decimal::new(13_99, 2),
            currency: "USD".to_string(),
            status: CartStatus::Open,
        }
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected_before_the_provider_is_called() {
        let manager = CartManager::new(
            Arc::new(FakeBackend { cart: Mutex::new(None) }),
            Arc::new(InMemoryCartSnapshotRepository::default()),
        );

        let result = manager.create_cart(&ProductId("B07H1V6RMC".to_string()), 0).await;
        assert!(matches!(
            result,
            Err(CartError::Domain(DomainError::InvalidQuantity(0)))
        ));

        let negative = manager.create_cart(&ProductId("B07H1V6RMC".to_string()), -3).await;
        assert!(matches!(
            negative,
            Err(CartError::Domain(DomainError::InvalidQuantity(-3)))
        ));
    }

    #[tokio::test]
    async fn create_cart_writes_a_snapshot() {
        let snapshots = Arc::new(InMemoryCartSnapshotRepository::default());
        let manager =
            CartManager::new(Arc::new(FakeBackend::with_cart(sample_cart())), snapshots.clone());

        let cart = manager.create_cart(&ProductId("B07H1V6RMC".to_string()), 1).await.expect("create");

        let stored = snapshots.find_by_id(&cart.id).await.expect("find").expect("present");
        assert_eq!(stored, cart);
    }

    #[tokio::test]
    async fn snapshot_status_overrides_provider_view() {
        let snapshots = Arc::new(InMemoryCartSnapshotRepository::default());
        let manager =
            CartManager::new(Arc::new(FakeBackend::with_cart(sample_cart())), snapshots.clone());

        let mut purchased = sample_cart();
        purchased.transition_to(CartStatus::CheckedOut).expect("transition");
        snapshots.save(purchased).await.expect("seed snapshot");

        let cart = manager.get_cart(&CartId("cart-1".to_string())).await.expect("get");
        assert_eq!(cart.status, CartStatus::CheckedOut);
    }
}

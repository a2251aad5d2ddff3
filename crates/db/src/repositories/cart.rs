use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use poltergeist_core::domain::cart::{Cart, CartId, CartLine, CartStatus};

use super::{CartSnapshotRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCartSnapshotRepository {
    pool: DbPool,
}

impl SqlCartSnapshotRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CartSnapshotRepository for SqlCartSnapshotRepository {
    async fn find_by_id(&self, id: &CartId) -> Result<Option<Cart>, RepositoryError> {
        let row = sqlx::query(
            "SELECT cart_id, lines_json, subtotal, currency, status
             FROM cart_snapshots
             WHERE cart_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| cart_from_row(&row)).transpose()
    }

    async fn save(&self, cart: Cart) -> Result<(), RepositoryError> {
        let lines_json = serde_json::to_string(&cart.lines)
            .map_err(|error| RepositoryError::Decode(format!("encode cart lines: {error}")))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO cart_snapshots (
                cart_id, lines_json, subtotal, currency, status, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(cart_id) DO UPDATE SET
                lines_json = excluded.lines_json,
                subtotal = excluded.subtotal,
                currency = excluded.currency,
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(&cart.id.0)
        .bind(lines_json)
        .bind(cart.subtotal.to_string())
        .bind(&cart.currency)
        .bind(cart.status.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn cart_from_row(row: &SqliteRow) -> Result<Cart, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = CartStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown cart status `{status_raw}`")))?;

    let lines_json = row.try_get::<String, _>("lines_json")?;
    let lines: Vec<CartLine> = serde_json::from_str(&lines_json)
        .map_err(|error| RepositoryError::Decode(format!("decode cart lines: {error}")))?;

    let subtotal_raw = row.try_get::<String, _>("subtotal")?;
    let subtotal = subtotal_raw.parse::<Decimal>().map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `subtotal`: {error}"))
    })?;

    Ok(Cart {
        id: CartId(row.try_get("cart_id")?),
        lines,
        subtotal,
        currency: row.try_get("currency")?,
        status,
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use poltergeist_core::domain::cart::{Cart, CartId, CartLine, CartStatus};
    use poltergeist_core::domain::product::ProductId;

    use super::SqlCartSnapshotRepository;
    use crate::repositories::CartSnapshotRepository;
    use crate::{connect_with_settings, migrations};

    fn sample_cart() -> Cart {
        Cart {
            id: CartId("cart-7".to_string()),
            lines: vec![CartLine {
                product_id: ProductId("B000TEST".to_string()),
                title: "USB cable".to_string(),
                quantity: 2,
                unit_price: "7.99".parse::<Decimal>().expect("decimal literal"),
            }],
            subtotal: "15.98".parse().expect("decimal literal"),
            currency: "USD".to_string(),
            status: CartStatus::Open,
        }
    }

    #[tokio::test]
    async fn save_and_reload_preserves_cart() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repository = SqlCartSnapshotRepository::new(pool);

        let cart = sample_cart();
        repository.save(cart.clone()).await.expect("save");

        let loaded = repository.find_by_id(&cart.id).await.expect("find").expect("present");
        assert_eq!(loaded, cart);
    }

    #[tokio::test]
    async fn save_overwrites_existing_snapshot() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repository = SqlCartSnapshotRepository::new(pool);

        let mut cart = sample_cart();
        repository.save(cart.clone()).await.expect("save open");

        cart.transition_to(CartStatus::CheckedOut).expect("transition");
        repository.save(cart.clone()).await.expect("save checked out");

        let loaded = repository.find_by_id(&cart.id).await.expect("find").expect("present");
        assert_eq!(loaded.status, CartStatus::CheckedOut);
    }
}

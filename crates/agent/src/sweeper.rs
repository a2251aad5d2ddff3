use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use poltergeist_core::ledger::SpendingLedger;

/// Background task that releases reservations whose TTL elapsed without a
/// commit or release, returning the held amount to the buyer's capacity.
pub struct ReservationSweeper {
    ledger: Arc<dyn SpendingLedger>,
    interval: Duration,
}

impl ReservationSweeper {
    pub fn new(ledger: Arc<dyn SpendingLedger>, interval: Duration) -> Self {
        Self { ledger, interval }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately, which doubles as a
            // startup sweep for holds orphaned by a previous run.
            loop {
                ticker.tick().await;
                match self.ledger.release_expired(Utc::now()).await {
                    Ok(0) => debug!("reservation sweep: nothing to release"),
                    Ok(released) => info!(released, "reservation sweep released expired holds"),
                    Err(error) => warn!(%error, "reservation sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    use poltergeist_core::domain::user::{OverLimitPolicy, UserId};
    use poltergeist_core::ledger::SpendingLedger;
    use poltergeist_db::repositories::InMemorySpendingLedger;

    use super::ReservationSweeper;

    #[tokio::test]
    async fn sweeper_releases_expired_holds() {
        let ledger = Arc::new(InMemorySpendingLedger::default());
        let user = UserId("buyer@example.com".to_string());
        let limit: Decimal = "100".parse().expect("decimal literal");
        ledger.set_limit(&user, limit, OverLimitPolicy::Confirm).await.expect("limit");

        ledger
            .reserve(&user, "60".parse().expect("decimal literal"), ChronoDuration::seconds(-1))
            .await
            .expect("expired hold");

        let handle =
            ReservationSweeper::new(ledger.clone(), Duration::from_millis(10)).spawn();

        // Give the first tick a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let status = ledger.status(&user).await.expect("status");
        assert_eq!(status.reserved, Decimal::ZERO);
    }
}

//! End-to-end coverage of the SQL repositories over the migrated schema,
//! including writer contention on the ledger.

use std::sync::Arc;

use chrono::Duration;
use rust_decimal::Decimal;

use poltergeist_core::domain::cart::{Cart, CartId, CartLine, CartStatus};
use poltergeist_core::domain::product::ProductId;
use poltergeist_core::domain::transaction::{Transaction, TransactionStatus};
use poltergeist_core::domain::user::{OverLimitPolicy, UnknownUserPolicy, UserId};
use poltergeist_core::history::ChainSigner;
use poltergeist_core::ledger::{LedgerError, SpendingLedger};
use poltergeist_db::{
    connect_with_settings, migrations, CartSnapshotRepository, DbPool, SqlCartSnapshotRepository,
    SqlSpendingLedger, SqlTransactionRepository, TransactionRepository,
};

fn money(value: &str) -> Decimal {
    value.parse().expect("decimal literal")
}

async fn memory_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

/// A file-backed database is required for contention tests; an in-memory
/// pool capped at one connection serializes everything before SQLite does.
async fn file_pool(dir: &tempfile::TempDir, max_connections: u32) -> DbPool {
    let path = dir.path().join("poltergeist.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = connect_with_settings(&url, max_connections, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

fn strict_ledger(pool: DbPool) -> SqlSpendingLedger {
    SqlSpendingLedger::new(pool, UnknownUserPolicy::Reject, OverLimitPolicy::Reject)
}

#[tokio::test]
async fn purchase_flow_round_trips_through_sql_repositories() {
    let pool = memory_pool().await;
    let ledger = strict_ledger(pool.clone());
    let transactions = SqlTransactionRepository::new(pool.clone());
    let snapshots = SqlCartSnapshotRepository::new(pool.clone());
    let signer = ChainSigner::new("test-signing-key");

    let user = UserId("buyer@example.com".to_string());
    let cart_id = CartId("cart-1".to_string());

    ledger.set_limit(&user, money("100"), OverLimitPolicy::Reject).await.expect("set limit");
    let reservation =
        ledger.reserve(&user, money("25.00"), Duration::seconds(600)).await.expect("reserve");

    let mut transaction = Transaction::pending(
        cart_id.clone(),
        user.clone(),
        money("25.00"),
        "USD",
        reservation.token.clone(),
    );
    let prev_hash = transactions
        .latest_for_user(&user)
        .await
        .expect("latest")
        .and_then(|previous| previous.entry_hash);
    signer.seal(&mut transaction, prev_hash);
    transactions.append(transaction.clone()).await.expect("append");

    ledger.commit(&reservation.token).await.expect("commit");
    transaction.mark_succeeded("order-12345").expect("mark succeeded");
    transactions.settle(&transaction).await.expect("settle");

    let mut cart = Cart {
        id: cart_id.clone(),
        lines: vec![CartLine {
            product_id: ProductId("B07H1V6RMC".to_string()),
            title: "Anker USB-C Cable".to_string(),
            quantity: 1,
            unit_price: money("25.00"),
        }],
        subtotal: money("25.00"),
        currency: "USD".to_string(),
        status: CartStatus::Open,
    };
    cart.transition_to(CartStatus::CheckedOut).expect("transition");
    snapshots.save(cart).await.expect("save snapshot");

    let status = ledger.status(&user).await.expect("status");
    assert_eq!(status.spent, money("25.00"));
    assert_eq!(status.reserved, Decimal::ZERO);

    let listed = transactions.list_for_user(&user, 10).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, TransactionStatus::Succeeded);
    assert_eq!(listed[0].receipt_ref.as_deref(), Some("order-12345"));

    let mut chain = listed;
    chain.reverse();
    assert!(signer.verify(&user, &chain).valid);

    let snapshot = snapshots.find_by_id(&cart_id).await.expect("find").expect("present");
    assert_eq!(snapshot.status, CartStatus::CheckedOut);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_reservations_within_limit_all_succeed() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = file_pool(&dir, 8).await;
    let ledger = Arc::new(strict_ledger(pool));

    let user = UserId("buyer@example.com".to_string());
    ledger.set_limit(&user, money("1000"), OverLimitPolicy::Reject).await.expect("set limit");

    let mut handles = Vec::new();
    for _ in 0..20 {
        let ledger = ledger.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            ledger.reserve(&user, money("1"), Duration::seconds(600)).await
        }));
    }

    for handle in handles {
        let result = handle.await.expect("join");
        assert!(result.is_ok(), "reservation within limit failed: {result:?}");
    }

    let status = ledger.status(&user).await.expect("status");
    assert_eq!(status.reserved, money("20"));
    assert_eq!(status.spent, Decimal::ZERO);
}

#[tokio::test(flavor = "multi_thread")]
async fn contending_reservations_settle_on_capacity_not_storage_errors() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = file_pool(&dir, 4).await;
    let ledger = Arc::new(strict_ledger(pool));

    let user = UserId("buyer@example.com".to_string());
    ledger.set_limit(&user, money("50"), OverLimitPolicy::Reject).await.expect("set limit");

    let mut handles = Vec::new();
    for _ in 0..2 {
        let ledger = ledger.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            ledger.reserve(&user, money("30"), Duration::seconds(600)).await
        }));
    }

    let mut granted = 0;
    let mut over_limit = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => granted += 1,
            Err(LedgerError::LimitExceeded { .. }) => over_limit += 1,
            Err(other) => panic!("expected a capacity decision, got {other:?}"),
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(over_limit, 1);

    let status = ledger.status(&user).await.expect("status");
    assert_eq!(status.reserved, money("30"));
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::ExposeSecret;
use tracing::info;

use poltergeist_agent::{CheckoutCoordinator, PurchaseHistory, ReservationSweeper};
use poltergeist_commerce::{CartManager, FirecrawlClient, ProductResolver, RyeClient};
use poltergeist_core::config::{LogFormat, LoggingConfig};
use poltergeist_core::{AppConfig, ChainSigner, CheckoutConfig, LoadOptions, SpendingLedger};
use poltergeist_db::{
    connect, migrations, CartSnapshotRepository, SqlCartSnapshotRepository, SqlSpendingLedger,
    SqlTransactionRepository, TransactionRepository,
};
use poltergeist_mcp::{AppState, McpServer};

#[derive(Parser)]
#[command(name = "poltergeist-mcp", version, about = "Poltergeist MCP server over stdio")]
struct Args {
    /// Path to poltergeist.toml; falls back to the default search order.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// stdout is the protocol channel, so every log line goes to stderr.
fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(LoadOptions {
        config_path: args.config,
        require_file: false,
        overrides: Default::default(),
    })
    .context("failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "poltergeist-mcp starting");

    let pool = connect(&config.database)
        .await
        .with_context(|| format!("failed to open database `{}`", config.database.url))?;
    let report = migrations::run_pending(&pool)
        .await
        .context("failed to run database migrations")?;
    if report.newly_applied > 0 {
        info!(count = report.newly_applied, "applied pending database migrations");
    }

    let rye = Arc::new(RyeClient::new(&config.rye).context("failed to build Rye client")?);
    let firecrawl = Arc::new(
        FirecrawlClient::new(&config.firecrawl).context("failed to build Firecrawl client")?,
    );

    let ledger: Arc<dyn SpendingLedger> = Arc::new(SqlSpendingLedger::new(
        pool.clone(),
        config.ledger.unknown_user_policy,
        config.ledger.default_on_limit,
    ));
    let transactions: Arc<dyn TransactionRepository> =
        Arc::new(SqlTransactionRepository::new(pool.clone()));
    let snapshots: Arc<dyn CartSnapshotRepository> =
        Arc::new(SqlCartSnapshotRepository::new(pool.clone()));
    let signer = ChainSigner::new(config.history.signing_key.expose_secret());

    let checkout_config = CheckoutConfig {
        max_attempts: config.checkout.max_attempts,
        submit_timeout_secs: config.checkout.submit_timeout_secs,
        retry_base_delay_ms: config.checkout.retry_base_delay_ms,
        retry_backoff_multiplier: config.checkout.retry_backoff_multiplier,
        reservation_ttl_secs: config.checkout.reservation_ttl_secs,
    };

    let state = AppState {
        resolver: ProductResolver::new(firecrawl, rye.clone()),
        carts: CartManager::new(rye.clone(), snapshots.clone()),
        coordinator: CheckoutCoordinator::new(
            rye,
            ledger.clone(),
            transactions.clone(),
            snapshots,
            signer.clone(),
            checkout_config,
        ),
        history: PurchaseHistory::new(transactions, signer, config.history.default_list_limit),
        ledger: ledger.clone(),
        default_on_limit: config.ledger.default_on_limit,
    };

    // Expired holds are swept for as long as the server runs.
    let sweeper = ReservationSweeper::new(
        ledger,
        Duration::from_secs(config.checkout.sweep_interval_secs),
    )
    .spawn();

    let result = McpServer::new(Arc::new(state)).serve_stdio().await;

    sweeper.abort();
    result
}

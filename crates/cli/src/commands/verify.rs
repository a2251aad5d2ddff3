use crate::commands::CommandResult;
use poltergeist_core::config::{AppConfig, LoadOptions};
use poltergeist_core::{ChainSigner, UserId};
use poltergeist_db::{connect, SqlTransactionRepository, TransactionRepository};
use secrecy::ExposeSecret;

pub fn run(user: &str) -> CommandResult {
    let user = user.trim();
    if user.is_empty() {
        return CommandResult::failure("verify", "invalid_argument", "user must not be empty", 2);
    }

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "verify",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "verify",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let user_id = UserId(user.to_string());
    let signer = ChainSigner::new(config.history.signing_key.expose_secret());

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        let repository = SqlTransactionRepository::new(pool.clone());
        let mut entries = repository
            .list_for_user(&user_id, u32::MAX)
            .await
            .map_err(|error| ("history", error.to_string(), 5u8))?;
        pool.close().await;

        // Stored most-recent-first; the chain walks oldest-first.
        entries.reverse();
        Ok::<_, (&'static str, String, u8)>(signer.verify(&user_id, &entries))
    });

    match result {
        Ok(verification) if verification.valid => CommandResult::success(
            "verify",
            format!(
                "chain intact for `{user}`: {} entries, latest hash {}",
                verification.verified_entries,
                verification.latest_hash.as_deref().unwrap_or("(none)")
            ),
        ),
        Ok(verification) => CommandResult::failure(
            "verify",
            "chain_tampered",
            format!(
                "chain broken for `{user}` after {} verified entries: {}",
                verification.verified_entries,
                verification.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
            6,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("verify", error_class, message, exit_code)
        }
    }
}

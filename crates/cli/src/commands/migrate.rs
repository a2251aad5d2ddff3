use crate::commands::CommandResult;
use poltergeist_core::config::{AppConfig, LoadOptions};
use poltergeist_db::{connect, migrations};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
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
                "migrate",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let report = migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<migrations::MigrationReport, (&'static str, String, u8)>(report)
    });

    match result {
        Ok(report) => {
            let version = report
                .schema_version
                .map(|version| version.to_string())
                .unwrap_or_else(|| "none".to_string());
            let message = if report.newly_applied == 0 {
                format!("purchase schema already current (version {version})")
            } else {
                format!(
                    "applied {} migration(s); purchase schema now at version {version}",
                    report.newly_applied
                )
            };
            CommandResult::success("migrate", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}

use std::env;
use std::sync::{Mutex, OnceLock};

use poltergeist_cli::commands::{doctor, migrate, verify};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(
        &[
            ("RYE_AUTH_HEADER", "Basic dGVzdA=="),
            ("RYE_SHOPPER_IP", "127.0.0.1"),
            ("POLTERGEIST_DATABASE_URL", "sqlite::memory:"),
        ],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 0, "expected successful migrate run");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["status"], "ok");
        },
    );
}

#[test]
fn migrate_returns_config_failure_without_credentials() {
    with_env(&[], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn verify_rejects_empty_user_before_loading_config() {
    with_env(&[], || {
        let result = verify::run("   ");
        assert_eq!(result.exit_code, 2);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "verify");
        assert_eq!(payload["error_class"], "invalid_argument");
    });
}

#[test]
fn verify_reports_intact_chain_for_unknown_user() {
    let db_path = env::temp_dir().join(format!(
        "poltergeist-cli-verify-{}.db",
        std::process::id()
    ));
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

    with_env(
        &[
            ("RYE_AUTH_HEADER", "Basic dGVzdA=="),
            ("RYE_SHOPPER_IP", "127.0.0.1"),
            ("POLTERGEIST_DATABASE_URL", db_url.as_str()),
        ],
        || {
            let migrated = migrate::run();
            assert_eq!(migrated.exit_code, 0, "migrate failed: {}", migrated.output);

            let result = verify::run("nobody@example.com");
            assert_eq!(result.exit_code, 0, "verify failed: {}", result.output);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "verify");
            assert_eq!(payload["status"], "ok");
            assert!(payload["message"].as_str().unwrap().contains("0 entries"));
        },
    );

    let _ = std::fs::remove_file(&db_path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.clone().into_os_string();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(sidecar);
    }
}

#[test]
fn doctor_json_reports_config_failure_without_credentials() {
    with_env(&[], || {
        let output = doctor::run(true);
        let payload: Value = serde_json::from_str(&output).expect("doctor should emit JSON");
        assert_eq!(payload["overall_status"], "fail");

        let checks = payload["checks"].as_array().expect("checks array");
        let config_check = checks
            .iter()
            .find(|check| check["name"] == "config_validation")
            .expect("config_validation check present");
        assert_eq!(config_check["status"], "fail");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be JSON")
}

static ENV_GUARD: OnceLock<Mutex<()>> = OnceLock::new();

const MANAGED_VARS: &[&str] = &[
    "RYE_AUTH_HEADER",
    "RYE_SHOPPER_IP",
    "POLTERGEIST_RYE_AUTH_HEADER",
    "POLTERGEIST_RYE_SHOPPER_IP",
    "POLTERGEIST_DATABASE_URL",
];

fn with_env(vars: &[(&str, &str)], body: impl FnOnce()) {
    let _guard = ENV_GUARD.get_or_init(|| Mutex::new(())).lock().unwrap();

    let saved: Vec<(&str, Option<String>)> =
        MANAGED_VARS.iter().map(|name| (*name, env::var(name).ok())).collect();

    for name in MANAGED_VARS {
        env::remove_var(name);
    }
    for (name, value) in vars {
        env::set_var(name, value);
    }

    body();

    for (name, value) in saved {
        match value {
            Some(value) => env::set_var(name, value),
            None => env::remove_var(name),
        }
    }
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use poltergeist_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let doc = config_file_doc.as_ref();
    let path = config_file_path.as_deref();

    let auth_header = redact_secret(config.rye.auth_header.expose_secret());
    let api_key = match &config.firecrawl.api_key {
        Some(key) => redact_secret(key.expose_secret()),
        None => "(unset)".to_string(),
    };
    let signing_key = redact_secret(config.history.signing_key.expose_secret());

    let fields: Vec<(&str, String, Option<&str>)> = vec![
        ("database.url", config.database.url.clone(), Some("POLTERGEIST_DATABASE_URL")),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            Some("POLTERGEIST_DATABASE_MAX_CONNECTIONS"),
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            Some("POLTERGEIST_DATABASE_TIMEOUT_SECS"),
        ),
        (
            "database.busy_timeout_ms",
            config.database.busy_timeout_ms.to_string(),
            Some("POLTERGEIST_DATABASE_BUSY_TIMEOUT_MS"),
        ),
        ("rye.endpoint", config.rye.endpoint.clone(), Some("POLTERGEIST_RYE_ENDPOINT")),
        ("rye.auth_header", auth_header, Some("POLTERGEIST_RYE_AUTH_HEADER")),
        ("rye.shopper_ip", config.rye.shopper_ip.clone(), Some("POLTERGEIST_RYE_SHOPPER_IP")),
        (
            "firecrawl.endpoint",
            config.firecrawl.endpoint.clone(),
            Some("POLTERGEIST_FIRECRAWL_ENDPOINT"),
        ),
        ("firecrawl.api_key", api_key, Some("POLTERGEIST_FIRECRAWL_API_KEY")),
        (
            "checkout.max_attempts",
            config.checkout.max_attempts.to_string(),
            Some("POLTERGEIST_CHECKOUT_MAX_ATTEMPTS"),
        ),
        (
            "checkout.submit_timeout_secs",
            config.checkout.submit_timeout_secs.to_string(),
            Some("POLTERGEIST_CHECKOUT_SUBMIT_TIMEOUT_SECS"),
        ),
        (
            "checkout.reservation_ttl_secs",
            config.checkout.reservation_ttl_secs.to_string(),
            Some("POLTERGEIST_CHECKOUT_RESERVATION_TTL_SECS"),
        ),
        (
            "ledger.unknown_user_policy",
            config.ledger.unknown_user_policy.as_str().to_string(),
            Some("POLTERGEIST_LEDGER_UNKNOWN_USER_POLICY"),
        ),
        (
            "ledger.default_on_limit",
            config.ledger.default_on_limit.as_str().to_string(),
            Some("POLTERGEIST_LEDGER_DEFAULT_ON_LIMIT"),
        ),
        (
            "history.default_list_limit",
            config.history.default_list_limit.to_string(),
            Some("POLTERGEIST_HISTORY_DEFAULT_LIST_LIMIT"),
        ),
        ("history.signing_key", signing_key, Some("POLTERGEIST_HISTORY_SIGNING_KEY")),
        ("logging.level", config.logging.level.clone(), Some("POLTERGEIST_LOGGING_LEVEL")),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_var) in fields {
        lines.push(render_line(key, &value, field_source(key, env_var, doc, path)));
    }
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("poltergeist.toml"), PathBuf::from("config/poltergeist.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key: &str,
    env_var: Option<&str>,
    doc: Option<&Value>,
    path: Option<&Path>,
) -> String {
    if let Some(var) = env_var {
        if env::var(var).is_ok() {
            return format!("env:{var}");
        }
    }

    if let (Some(doc), Some(path)) = (doc, path) {
        let mut cursor = Some(doc);
        for part in key.split('.') {
            cursor = cursor.and_then(|value| value.get(part));
        }
        if cursor.is_some() {
            return format!("file:{}", path.display());
        }
    }

    "default".to_string()
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("  {key} = {value}  [{source}]")
}

fn redact_secret(value: &str) -> String {
    if value.is_empty() {
        return "(unset)".to_string();
    }
    let prefix: String = value.chars().take(4).collect();
    format!("{prefix}*** (len {})", value.chars().count())
}

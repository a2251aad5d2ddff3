use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::user::{OverLimitPolicy, UnknownUserPolicy};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub rye: RyeConfig,
    pub firecrawl: FirecrawlConfig,
    pub checkout: CheckoutSettings,
    pub ledger: LedgerSettings,
    pub history: HistorySettings,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
    pub busy_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct RyeConfig {
    pub endpoint: String,
    pub auth_header: SecretString,
    pub shopper_ip: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct FirecrawlConfig {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub search_limit: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CheckoutSettings {
    pub max_attempts: u32,
    pub submit_timeout_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
    pub reservation_ttl_secs: i64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LedgerSettings {
    pub unknown_user_policy: UnknownUserPolicy,
    pub default_on_limit: OverLimitPolicy,
}

#[derive(Clone, Debug)]
pub struct HistorySettings {
    pub default_list_limit: u32,
    pub signing_key: SecretString,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub rye_auth_header: Option<String>,
    pub rye_shopper_ip: Option<String>,
    pub firecrawl_api_key: Option<String>,
    pub unknown_user_policy: Option<UnknownUserPolicy>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://poltergeist.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
                busy_timeout_ms: 5_000,
            },
            rye: RyeConfig {
                endpoint: "https://staging.graphql.api.rye.com/v1/query".to_string(),
                auth_header: String::new().into(),
                shopper_ip: String::new(),
                timeout_secs: 30,
            },
            firecrawl: FirecrawlConfig {
                endpoint: "https://api.firecrawl.dev/v1/search".to_string(),
                api_key: None,
                search_limit: 10,
                timeout_secs: 30,
            },
            checkout: CheckoutSettings {
                max_attempts: 3,
                submit_timeout_secs: 30,
                retry_base_delay_ms: 500,
                retry_backoff_multiplier: 2,
                reservation_ttl_secs: 600,
                sweep_interval_secs: 60,
            },
            ledger: LedgerSettings {
                unknown_user_policy: UnknownUserPolicy::Unlimited,
                default_on_limit: OverLimitPolicy::Confirm,
            },
            history: HistorySettings {
                default_list_limit: 10,
                signing_key: "poltergeist-dev-signing-key".to_string().into(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("poltergeist.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
            if let Some(busy_timeout_ms) = database.busy_timeout_ms {
                self.database.busy_timeout_ms = busy_timeout_ms;
            }
        }

        if let Some(rye) = patch.rye {
            if let Some(endpoint) = rye.endpoint {
                self.rye.endpoint = endpoint;
            }
            if let Some(auth_header_value) = rye.auth_header {
                self.rye.auth_header = secret_value(auth_header_value);
            }
            if let Some(shopper_ip) = rye.shopper_ip {
                self.rye.shopper_ip = shopper_ip;
            }
            if let Some(timeout_secs) = rye.timeout_secs {
                self.rye.timeout_secs = timeout_secs;
            }
        }

        if let Some(firecrawl) = patch.firecrawl {
            if let Some(endpoint) = firecrawl.endpoint {
                self.firecrawl.endpoint = endpoint;
            }
            if let Some(api_key_value) = firecrawl.api_key {
                self.firecrawl.api_key = Some(secret_value(api_key_value));
            }
            if let Some(search_limit) = firecrawl.search_limit {
                self.firecrawl.search_limit = search_limit;
            }
            if let Some(timeout_secs) = firecrawl.timeout_secs {
                self.firecrawl.timeout_secs = timeout_secs;
            }
        }

        if let Some(checkout) = patch.checkout {
            if let Some(max_attempts) = checkout.max_attempts {
                self.checkout.max_attempts = max_attempts;
            }
            if let Some(submit_timeout_secs) = checkout.submit_timeout_secs {
                self.checkout.submit_timeout_secs = submit_timeout_secs;
            }
            if let Some(retry_base_delay_ms) = checkout.retry_base_delay_ms {
                self.checkout.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_backoff_multiplier) = checkout.retry_backoff_multiplier {
                self.checkout.retry_backoff_multiplier = retry_backoff_multiplier;
            }
            if let Some(reservation_ttl_secs) = checkout.reservation_ttl_secs {
                self.checkout.reservation_ttl_secs = reservation_ttl_secs;
            }
            if let Some(sweep_interval_secs) = checkout.sweep_interval_secs {
                self.checkout.sweep_interval_secs = sweep_interval_secs;
            }
        }

        if let Some(ledger) = patch.ledger {
            if let Some(unknown_user_policy) = ledger.unknown_user_policy {
                self.ledger.unknown_user_policy = unknown_user_policy;
            }
            if let Some(default_on_limit) = ledger.default_on_limit {
                self.ledger.default_on_limit = default_on_limit;
            }
        }

        if let Some(history) = patch.history {
            if let Some(default_list_limit) = history.default_list_limit {
                self.history.default_list_limit = default_list_limit;
            }
            if let Some(signing_key_value) = history.signing_key {
                self.history.signing_key = secret_value(signing_key_value);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("POLTERGEIST_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("POLTERGEIST_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("POLTERGEIST_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("POLTERGEIST_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("POLTERGEIST_DATABASE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("POLTERGEIST_DATABASE_BUSY_TIMEOUT_MS") {
            self.database.busy_timeout_ms =
                parse_u64("POLTERGEIST_DATABASE_BUSY_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("POLTERGEIST_RYE_ENDPOINT") {
            self.rye.endpoint = value;
        }
        // Accept both our prefixed names and the provider's conventional
        // ones so agent launch configs stay copy-pasteable.
        let rye_auth =
            read_env("POLTERGEIST_RYE_AUTH_HEADER").or_else(|| read_env("RYE_AUTH_HEADER"));
        if let Some(value) = rye_auth {
            self.rye.auth_header = secret_value(value);
        }
        let rye_ip = read_env("POLTERGEIST_RYE_SHOPPER_IP").or_else(|| read_env("RYE_SHOPPER_IP"));
        if let Some(value) = rye_ip {
            self.rye.shopper_ip = value;
        }
        if let Some(value) = read_env("POLTERGEIST_RYE_TIMEOUT_SECS") {
            self.rye.timeout_secs = parse_u64("POLTERGEIST_RYE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("POLTERGEIST_FIRECRAWL_ENDPOINT") {
            self.firecrawl.endpoint = value;
        }
        let firecrawl_key =
            read_env("POLTERGEIST_FIRECRAWL_API_KEY").or_else(|| read_env("FIRECRAWL_API_KEY"));
        if let Some(value) = firecrawl_key {
            self.firecrawl.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("POLTERGEIST_FIRECRAWL_SEARCH_LIMIT") {
            self.firecrawl.search_limit = parse_u32("POLTERGEIST_FIRECRAWL_SEARCH_LIMIT", &value)?;
        }

        if let Some(value) = read_env("POLTERGEIST_CHECKOUT_MAX_ATTEMPTS") {
            self.checkout.max_attempts = parse_u32("POLTERGEIST_CHECKOUT_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("POLTERGEIST_CHECKOUT_SUBMIT_TIMEOUT_SECS") {
            self.checkout.submit_timeout_secs =
                parse_u64("POLTERGEIST_CHECKOUT_SUBMIT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("POLTERGEIST_CHECKOUT_RESERVATION_TTL_SECS") {
            self.checkout.reservation_ttl_secs =
                parse_i64("POLTERGEIST_CHECKOUT_RESERVATION_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("POLTERGEIST_CHECKOUT_SWEEP_INTERVAL_SECS") {
            self.checkout.sweep_interval_secs =
                parse_u64("POLTERGEIST_CHECKOUT_SWEEP_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("POLTERGEIST_LEDGER_UNKNOWN_USER_POLICY") {
            self.ledger.unknown_user_policy = UnknownUserPolicy::parse(&value).ok_or(
                ConfigError::InvalidEnvOverride {
                    key: "POLTERGEIST_LEDGER_UNKNOWN_USER_POLICY".to_string(),
                    value,
                },
            )?;
        }
        if let Some(value) = read_env("POLTERGEIST_LEDGER_DEFAULT_ON_LIMIT") {
            self.ledger.default_on_limit =
                OverLimitPolicy::parse(&value).ok_or(ConfigError::InvalidEnvOverride {
                    key: "POLTERGEIST_LEDGER_DEFAULT_ON_LIMIT".to_string(),
                    value,
                })?;
        }

        if let Some(value) = read_env("POLTERGEIST_HISTORY_SIGNING_KEY") {
            self.history.signing_key = secret_value(value);
        }
        if let Some(value) = read_env("POLTERGEIST_HISTORY_DEFAULT_LIST_LIMIT") {
            self.history.default_list_limit =
                parse_u32("POLTERGEIST_HISTORY_DEFAULT_LIST_LIMIT", &value)?;
        }

        let log_level =
            read_env("POLTERGEIST_LOGGING_LEVEL").or_else(|| read_env("POLTERGEIST_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("POLTERGEIST_LOGGING_FORMAT").or_else(|| read_env("POLTERGEIST_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(rye_auth_header) = overrides.rye_auth_header {
            self.rye.auth_header = secret_value(rye_auth_header);
        }
        if let Some(rye_shopper_ip) = overrides.rye_shopper_ip {
            self.rye.shopper_ip = rye_shopper_ip;
        }
        if let Some(firecrawl_api_key) = overrides.firecrawl_api_key {
            self.firecrawl.api_key = Some(secret_value(firecrawl_api_key));
        }
        if let Some(unknown_user_policy) = overrides.unknown_user_policy {
            self.ledger.unknown_user_policy = unknown_user_policy;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_rye(&self.rye)?;
        validate_firecrawl(&self.firecrawl)?;
        validate_checkout(&self.checkout)?;
        validate_history(&self.history)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("poltergeist.toml"), PathBuf::from("config/poltergeist.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if database.busy_timeout_ms == 0 || database.busy_timeout_ms > 60_000 {
        return Err(ConfigError::Validation(
            "database.busy_timeout_ms must be in range 1..=60000".to_string(),
        ));
    }

    Ok(())
}

fn validate_rye(rye: &RyeConfig) -> Result<(), ConfigError> {
    if !rye.endpoint.starts_with("https://") {
        return Err(ConfigError::Validation(
            "rye.endpoint must be an https:// URL".to_string(),
        ));
    }

    if rye.auth_header.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "rye.auth_header is required. Get it from the Rye console and pass it via RYE_AUTH_HEADER".to_string(),
        ));
    }

    if rye.shopper_ip.trim().is_empty() {
        return Err(ConfigError::Validation(
            "rye.shopper_ip is required (Rye-Shopper-IP header). Pass it via RYE_SHOPPER_IP"
                .to_string(),
        ));
    }

    if rye.timeout_secs == 0 || rye.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "rye.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_firecrawl(firecrawl: &FirecrawlConfig) -> Result<(), ConfigError> {
    if !firecrawl.endpoint.starts_with("http://") && !firecrawl.endpoint.starts_with("https://") {
        return Err(ConfigError::Validation(
            "firecrawl.endpoint must start with http:// or https://".to_string(),
        ));
    }

    if firecrawl.search_limit == 0 || firecrawl.search_limit > 50 {
        return Err(ConfigError::Validation(
            "firecrawl.search_limit must be in range 1..=50".to_string(),
        ));
    }

    Ok(())
}

fn validate_checkout(checkout: &CheckoutSettings) -> Result<(), ConfigError> {
    if checkout.max_attempts == 0 || checkout.max_attempts > 10 {
        return Err(ConfigError::Validation(
            "checkout.max_attempts must be in range 1..=10".to_string(),
        ));
    }

    if checkout.submit_timeout_secs == 0 || checkout.submit_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "checkout.submit_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if checkout.retry_backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "checkout.retry_backoff_multiplier must be greater than zero".to_string(),
        ));
    }

    if checkout.reservation_ttl_secs < 30 {
        return Err(ConfigError::Validation(
            "checkout.reservation_ttl_secs must be at least 30".to_string(),
        ));
    }

    if checkout.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "checkout.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_history(history: &HistorySettings) -> Result<(), ConfigError> {
    if history.default_list_limit == 0 {
        return Err(ConfigError::Validation(
            "history.default_list_limit must be at least 1".to_string(),
        ));
    }

    if history.signing_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "history.signing_key must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    rye: Option<RyePatch>,
    firecrawl: Option<FirecrawlPatch>,
    checkout: Option<CheckoutPatch>,
    ledger: Option<LedgerPatch>,
    history: Option<HistoryPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
    busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RyePatch {
    endpoint: Option<String>,
    auth_header: Option<String>,
    shopper_ip: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FirecrawlPatch {
    endpoint: Option<String>,
    api_key: Option<String>,
    search_limit: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckoutPatch {
    max_attempts: Option<u32>,
    submit_timeout_secs: Option<u64>,
    retry_base_delay_ms: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
    reservation_ttl_secs: Option<i64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LedgerPatch {
    unknown_user_policy: Option<UnknownUserPolicy>,
    default_on_limit: Option<OverLimitPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryPatch {
    default_list_limit: Option<u32>,
    signing_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::domain::user::UnknownUserPolicy;

    fn valid_options() -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                rye_auth_header: Some("Basic dGVzdA==".to_string()),
                rye_shopper_ip: Some("203.0.113.7".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[test]
    fn defaults_with_overrides_validate() {
        let config = AppConfig::load(valid_options()).expect("load");

        assert_eq!(config.checkout.max_attempts, 3);
        assert_eq!(config.checkout.submit_timeout_secs, 30);
        assert_eq!(config.checkout.reservation_ttl_secs, 600);
        assert_eq!(config.history.default_list_limit, 10);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn missing_rye_auth_fails_validation() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                rye_shopper_ip: Some("203.0.113.7".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        match result {
            Err(ConfigError::Validation(message)) => {
                assert!(message.contains("rye.auth_header"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn busy_timeout_patch_applies_and_validates() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[database]
busy_timeout_ms = 2500
"#
        )
        .expect("write patch");

        let mut options = valid_options();
        options.config_path = Some(file.path().to_path_buf());

        let config = AppConfig::load(options).expect("load");
        assert_eq!(config.database.busy_timeout_ms, 2_500);

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[database]
busy_timeout_ms = 0
"#
        )
        .expect("write patch");

        let mut options = valid_options();
        options.config_path = Some(file.path().to_path_buf());

        match AppConfig::load(options) {
            Err(ConfigError::Validation(message)) => {
                assert!(message.contains("database.busy_timeout_ms"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn non_sqlite_database_url_is_rejected() {
        let mut options = valid_options();
        options.overrides.database_url = Some("postgres://localhost/poltergeist".to_string());

        let result = AppConfig::load(options);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn toml_patch_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[checkout]
max_attempts = 5
retry_base_delay_ms = 100

[ledger]
unknown_user_policy = "reject"

[logging]
level = "debug"
format = "json"
"#
        )
        .expect("write patch");

        let mut options = valid_options();
        options.config_path = Some(file.path().to_path_buf());

        let config = AppConfig::load(options).expect("load");
        assert_eq!(config.checkout.max_attempts, 5);
        assert_eq!(config.checkout.retry_base_delay_ms, 100);
        assert_eq!(config.ledger.unknown_user_policy, UnknownUserPolicy::Reject);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn require_file_fails_when_missing() {
        let mut options = valid_options();
        options.config_path = Some("does-not-exist.toml".into());
        options.require_file = true;

        assert!(matches!(AppConfig::load(options), Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn programmatic_overrides_win() {
        let mut options = valid_options();
        options.overrides.firecrawl_api_key = Some("fc-test-key".to_string());

        let config = AppConfig::load(options).expect("load");
        assert_eq!(
            config.firecrawl.api_key.as_ref().map(|key| key.expose_secret().to_string()),
            Some("fc-test-key".to_string())
        );
    }
}

//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram Bot API token for the front end.
    pub bot_token: SecretString,
    /// Master key for the credential vault.
    pub vault_key: SecretString,
    /// Path to the local database file.
    pub db_path: String,
    /// Base URL of the automation bridge sidecar.
    pub bridge_url: String,
    /// Admin identities (usernames or numeric ids, `*` for everyone).
    pub admin_users: Vec<String>,
    /// Port for the HTTP status page.
    pub http_port: u16,
    /// Pause between bulk create operations.
    pub bulk_item_delay: Duration,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// `GROUPSMITH_BOT_TOKEN` and `GROUPSMITH_VAULT_KEY` are required;
    /// everything else has a sensible default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = require_env("GROUPSMITH_BOT_TOKEN")?;
        let vault_key = require_env("GROUPSMITH_VAULT_KEY")?;

        let db_path = std::env::var("GROUPSMITH_DB_PATH")
            .unwrap_or_else(|_| "./data/groupsmith.db".to_string());

        let bridge_url = std::env::var("GROUPSMITH_BRIDGE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8484".to_string());

        let admin_users: Vec<String> = std::env::var("GROUPSMITH_ADMIN_USERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let http_port: u16 = parse_env("GROUPSMITH_HTTP_PORT", 3000)?;
        let delay_secs: u64 = parse_env("GROUPSMITH_BULK_DELAY_SECS", 5)?;

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            vault_key: SecretString::from(vault_key),
            db_path,
            bridge_url,
            admin_users,
            http_port,
            bulk_item_delay: Duration::from_secs(delay_secs),
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

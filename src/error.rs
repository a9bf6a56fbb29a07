//! Error types for groupsmith.

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Onboarding error: {0}")]
    Flow(#[from] FlowError),

    #[error("Bulk run error: {0}")]
    Bulk(#[from] BulkError),

    #[error("Bot error: {0}")]
    Bot(#[from] BotError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Credential vault errors.
///
/// `Integrity` covers both a failed authentication tag and a structurally
/// malformed record (wrong field count, non-hex fields). Callers can tell
/// "tampered or corrupt" apart from "account missing" by matching on it.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Cipher failure: {0}")]
    Cipher(String),
}

/// Errors from the remote automation provider.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Unexpected bridge response: {0}")]
    InvalidResponse(String),
}

/// Terminal onboarding-flow errors.
///
/// Malformed user input is not an error — the state machine re-prompts
/// without a state change. These variants all discard the session.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Account limit reached: {used} of {limit} accounts linked")]
    Quota { used: usize, limit: usize },

    #[error("Could not reach the platform: {0}")]
    Transport(#[source] ClientError),

    #[error("Sign-in rejected: {0}")]
    Auth(#[source] ClientError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Bulk orchestration errors.
///
/// Per-item create failures are not errors — they are counted in the run's
/// tally and the loop continues. These variants abort the run as a whole.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("Requested count {requested} outside accepted range {min}-{max}")]
    CountOutOfRange {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("Connect failed: {0}")]
    Connect(#[source] ClientError),

    #[error("Create failed: {0}")]
    Create(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("Telegram API call {method} failed: {reason}")]
    Api { method: String, reason: String },

    #[error("Failed to send message to chat {chat_id}: {reason}")]
    SendFailed { chat_id: String, reason: String },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

impl FlowError {
    /// Translate an automation-client error into the flow taxonomy.
    pub fn from_client(err: ClientError) -> Self {
        match err {
            ClientError::Auth(_) => FlowError::Auth(err),
            _ => FlowError::Transport(err),
        }
    }
}

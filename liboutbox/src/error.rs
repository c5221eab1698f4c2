//! Error types for Outbox

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OutboxError>;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl OutboxError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            OutboxError::InvalidInput(_) => 3,
            OutboxError::Config(_) => 2,
            OutboxError::Crypto(CryptoError::KeyMissing) => 2,
            OutboxError::Crypto(_) => 1,
            OutboxError::Database(_) => 1,
            OutboxError::Token(_) => 1,
            OutboxError::Publish(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("A post is already scheduled for this tenant at this time")]
    DuplicateSchedule,
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption key is not configured")]
    KeyMissing,

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Failures resolving a usable access token for a tenant.
///
/// None of these are retryable: each one means the tenant has to
/// reconnect their account before publishing can succeed.
#[derive(Error, Debug, Clone)]
pub enum TokenError {
    #[error("No connected account for tenant {0}")]
    NotConnected(String),

    #[error("Token expired and no refresh token is available")]
    RefreshUnavailable,

    #[error("Token refresh rejected: {0}")]
    RefreshFailed(String),
}

#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Provider server error (status {status}): {detail}")]
    Server { status: u16, detail: String },

    #[error("Authentication rejected by provider (status {status})")]
    Auth { status: u16 },

    #[error("Post rejected by provider (status {status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("Provider protocol error: {0}")]
    Protocol(String),
}

impl PublishError {
    /// Whether a retry with backoff has any chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Timeout(_)
            | PublishError::Connection(_)
            | PublishError::RateLimited(_)
            | PublishError::Server { .. } => true,
            PublishError::Auth { .. }
            | PublishError::Rejected { .. }
            | PublishError::Protocol(_) => false,
        }
    }
}

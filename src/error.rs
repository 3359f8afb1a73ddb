use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire pipeline
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors raised while talking to the external ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("RPC call {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("Could not decode ledger data: {0}")]
    Decode(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Settlement submission failed: {0}")]
    Submission(String),

    #[error("Timed out waiting for confirmation of {0}")]
    ConfirmationTimeout(String),
}

impl LedgerError {
    /// Transient failures leave state untouched and are retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Rpc { .. }
                | LedgerError::Submission(_)
                | LedgerError::ConfirmationTimeout(_)
        )
    }

    pub fn rpc(method: &str, message: impl Into<String>) -> Self {
        LedgerError::Rpc {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

impl AppError {
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(_) => true,
            AppError::Ledger(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Ledger(LedgerError::rpc("http", error.to_string()))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

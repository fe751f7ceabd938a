//! Billing error taxonomy.

use promptsouq_shared::ParseEnumError;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the subscription core.
///
/// Provider failures carry a `transient` flag so callers can distinguish
/// retry-worthy outages from permanent rejections.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// User, subscription, or external record absent.
    #[error("{0}")]
    NotFound(String),

    /// An operation's precondition was violated.
    #[error("{0}")]
    InvalidState(String),

    /// Malformed operation input.
    #[error("{0}")]
    Validation(String),

    /// A compare-and-swap write lost to a concurrent writer.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The external billing system call failed.
    #[error("billing provider error: {message}")]
    Provider { message: String, transient: bool },

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,
}

impl BillingError {
    pub fn provider_transient(message: impl Into<String>) -> Self {
        BillingError::Provider {
            message: message.into(),
            transient: true,
        }
    }

    pub fn provider_permanent(message: impl Into<String>) -> Self {
        BillingError::Provider {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::Provider { transient: true, .. })
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(e: ParseEnumError) -> Self {
        BillingError::Validation(e.to_string())
    }
}

//! Error taxonomy and retry logic.
//!
//! `ChatError` is what services return; the HTTP layer maps each variant to
//! exactly one status code. Best-effort side effects (search indexing) go
//! through [`with_retry`].

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Missing or malformed input. Rejected before any store access.
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized. Please login to continue.")]
    Unauthorized,

    /// Absent, or owned by someone else. The two are indistinguishable.
    #[error("{0}")]
    NotFound(String),

    /// Connection failures and similar; the whole request may be retried.
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),

    /// Persistence failure, including constraint violations.
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ChatError::NotFound(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::Validation(_) => ErrorCategory::Validation,
            ChatError::Unauthorized | ChatError::NotFound(_) => ErrorCategory::Authorization,
            ChatError::Transient(_) => ErrorCategory::Transient,
            ChatError::Store(err) => categorize_error(err),
            ChatError::Config(_) => ErrorCategory::Configuration,
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::Store(err.into())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Store(err.into())
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        ChatError::Transient(anyhow::anyhow!("failed to join database task: {err}"))
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// policy runs out of attempts.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                let category = categorize_error(&err);
                if attempts >= policy.max_attempts || !category.is_retryable() {
                    return Err(err.context(format!("operation failed after {attempts} attempts")));
                }

                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "retrying after error: {err:#}"
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-related errors (retryable)
    Network,

    /// Lock contention or busy database (retryable)
    Transient,

    /// Timeout errors (retryable)
    Timeout,

    /// Constraint violations (not retryable)
    Constraint,

    /// Configuration errors (not retryable)
    Configuration,

    /// Validation errors (not retryable)
    Validation,

    /// Missing identity or foreign resource (not retryable)
    Authorization,

    /// Unknown errors
    Unknown,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Transient | ErrorCategory::Timeout
        )
    }
}

/// Categorize an error by its message chain.
pub fn categorize_error(error: &anyhow::Error) -> ErrorCategory {
    let error_str = format!("{error:#}").to_lowercase();

    if error_str.contains("timed out") || error_str.contains("timeout") {
        ErrorCategory::Timeout
    } else if error_str.contains("constraint") || error_str.contains("unique") {
        ErrorCategory::Constraint
    } else if error_str.contains("network")
        || error_str.contains("connection")
        || error_str.contains("dns")
    {
        ErrorCategory::Network
    } else if error_str.contains("database is locked") || error_str.contains("busy") {
        ErrorCategory::Transient
    } else if error_str.contains("config") {
        ErrorCategory::Configuration
    } else if error_str.contains("invalid") {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

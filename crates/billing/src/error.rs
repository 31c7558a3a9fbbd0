//! Billing error types

use thiserror::Error;
use usagebill_shared::DomainError;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad input, rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Double-billing attempt; re-read state before retrying
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Nothing above the minimum amount is waiting to be billed
    #[error("Nothing to bill for customer {customer_id}")]
    NothingToBill { customer_id: String },

    /// Remote payment gateway failure
    #[error("Payment gateway error{}: {message}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Gateway {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    /// Projection with zero revenue
    #[error("Division by zero: {0}")]
    DivisionByZero(String),

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Gateway error that a scheduler may retry
    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway {
            status: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Gateway rejected the request; retrying the same call will not help
    pub fn gateway_rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Gateway {
            status,
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway { retryable: true, .. } | Self::Database(_))
    }

    /// Outcomes that signal "no work to do" rather than a failure
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NothingToBill { .. })
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(request) => {
                let status = request.http_status;
                // 429 and 5xx are transient at the processor
                let retryable = status == 429 || status >= 500;
                BillingError::Gateway {
                    status: Some(status),
                    message: err.to_string(),
                    retryable,
                }
            }
            stripe::StripeError::Timeout => BillingError::gateway("request timed out"),
            _ => BillingError::gateway(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<DomainError> for BillingError {
    fn from(err: DomainError) -> Self {
        BillingError::Validation(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

//! Billing error types

use eventpass_shared::{TicketError, TicketStatus};
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Transient provider failure or timeout; safe to retry
    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider rejected the request; retrying will not help
    #[error("Invalid provider request: {0}")]
    InvalidRequest(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Ticket not found: {0}")]
    TicketNotFound(Uuid),

    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    #[error("Event is not open for booking")]
    EventClosed,

    #[error("Event is sold out")]
    CapacityExceeded,

    #[error("Ticket belongs to another user")]
    NotTicketOwner,

    #[error("Ticket is {0}, expected pending")]
    TicketNotPending(TicketStatus),

    #[error("Ticket is not eligible for a refund")]
    RefundNotEligible,

    #[error("Ticket data inconsistent: {0}")]
    Inconsistent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error("Database error: {0}")]
    Database(String),
}

impl BillingError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ProviderUnavailable(_) | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BillingError::InvalidRequest(err.to_string())
        } else {
            BillingError::ProviderUnavailable(err.to_string())
        }
    }
}

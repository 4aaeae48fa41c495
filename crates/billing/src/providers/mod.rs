//! Payment provider adapters
//!
//! Each provider implements [`PaymentGateway`]. Callers never talk to an
//! adapter directly: [`PaymentGateways`] picks the adapter from the ticket's
//! stored provider tag and bounds every call with a timeout.

pub mod paypal;
pub mod stripe;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventpass_shared::{EventInfo, PaymentProvider, TicketRecord};
use reqwest::header::HeaderMap;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub use self::paypal::PaypalGateway;
pub use self::stripe::StripeGateway;

/// A hosted checkout the buyer is redirected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub session_id: String,
    pub checkout_url: String,
}

/// Provider view of a checkout session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    NotCompleted,
    Completed { payment_ref: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { refund_id: String },
    /// The provider reports the payment as refunded already
    AlreadyRefunded,
}

/// What a verified webhook tells us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEventKind {
    PaymentCompleted {
        session_id: String,
        payment_ref: String,
    },
    /// Buyer approved the order; the payment still has to be captured
    CheckoutApproved { session_id: String },
    PaymentFailed {
        session_id: Option<String>,
        reason: String,
    },
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: ProviderEventKind,
}

/// Idempotency key for the refund of a ticket
///
/// Derived from the ticket alone so two racing cancellations collapse into
/// one provider refund.
pub fn refund_idempotency_key(ticket_id: Uuid) -> String {
    format!("ticket-refund-{ticket_id}")
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    async fn create_checkout_session(
        &self,
        ticket: &TicketRecord,
        event: &EventInfo,
    ) -> BillingResult<CheckoutSession>;

    /// Read-only status lookup
    async fn session_status(&self, session_id: &str) -> BillingResult<SessionStatus>;

    /// Complete a buyer-approved payment where the provider needs an explicit
    /// capture. Must be idempotent.
    async fn finalize_approved(&self, session_id: &str) -> BillingResult<SessionStatus> {
        self.session_status(session_id).await
    }

    /// Stop a checkout from accepting payment before it is replaced.
    ///
    /// Returns the final provider status: `Completed` when the buyer paid
    /// before the session could be closed, `Failed` once it is closed.
    async fn expire_session(&self, session_id: &str) -> BillingResult<SessionStatus>;

    async fn refund(
        &self,
        payment_ref: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> BillingResult<RefundOutcome>;

    /// Authenticate and parse an inbound webhook
    async fn verify_webhook(&self, headers: &HeaderMap, payload: &str)
        -> BillingResult<ProviderEvent>;
}

/// Provider dispatch with bounded calls
#[derive(Clone)]
pub struct PaymentGateways {
    stripe: Arc<dyn PaymentGateway>,
    paypal: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl PaymentGateways {
    pub fn new(
        stripe: Arc<dyn PaymentGateway>,
        paypal: Arc<dyn PaymentGateway>,
        timeout: Duration,
    ) -> Self {
        Self {
            stripe,
            paypal,
            timeout,
        }
    }

    pub fn for_provider(&self, provider: PaymentProvider) -> &Arc<dyn PaymentGateway> {
        match provider {
            PaymentProvider::Stripe => &self.stripe,
            PaymentProvider::Paypal => &self.paypal,
        }
    }

    async fn bounded<T>(
        &self,
        provider: PaymentProvider,
        operation: &'static str,
        call: impl Future<Output = BillingResult<T>>,
    ) -> BillingResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    provider = %provider,
                    operation = operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Provider call timed out"
                );
                Err(BillingError::ProviderUnavailable(format!(
                    "{provider} {operation} timed out"
                )))
            }
        }
    }

    pub async fn create_checkout_session(
        &self,
        ticket: &TicketRecord,
        event: &EventInfo,
    ) -> BillingResult<CheckoutSession> {
        let provider = ticket.payment_provider;
        self.bounded(
            provider,
            "create_checkout_session",
            self.for_provider(provider)
                .create_checkout_session(ticket, event),
        )
        .await
    }

    pub async fn session_status(
        &self,
        provider: PaymentProvider,
        session_id: &str,
    ) -> BillingResult<SessionStatus> {
        self.bounded(
            provider,
            "session_status",
            self.for_provider(provider).session_status(session_id),
        )
        .await
    }

    pub async fn finalize_approved(
        &self,
        provider: PaymentProvider,
        session_id: &str,
    ) -> BillingResult<SessionStatus> {
        self.bounded(
            provider,
            "finalize_approved",
            self.for_provider(provider).finalize_approved(session_id),
        )
        .await
    }

    pub async fn expire_session(
        &self,
        provider: PaymentProvider,
        session_id: &str,
    ) -> BillingResult<SessionStatus> {
        self.bounded(
            provider,
            "expire_session",
            self.for_provider(provider).expire_session(session_id),
        )
        .await
    }

    pub async fn refund(
        &self,
        provider: PaymentProvider,
        payment_ref: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> BillingResult<RefundOutcome> {
        self.bounded(
            provider,
            "refund",
            self.for_provider(provider)
                .refund(payment_ref, amount_cents, idempotency_key),
        )
        .await
    }

    pub async fn verify_webhook(
        &self,
        provider: PaymentProvider,
        headers: &HeaderMap,
        payload: &str,
    ) -> BillingResult<ProviderEvent> {
        self.bounded(
            provider,
            "verify_webhook",
            self.for_provider(provider).verify_webhook(headers, payload),
        )
        .await
    }
}

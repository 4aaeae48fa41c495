// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Eventpass Billing Module
//!
//! Keeps ticket status aligned with what the payment providers report.
//!
//! ## Features
//!
//! - **Booking**: capacity-checked ticket creation and hosted checkout
//! - **Webhooks**: verified, deduplicated provider notifications
//! - **Polling**: fast, regular and grace-window status checks, stale checkout sweep
//! - **Proactive confirmation**: buyer returns from checkout and asks for the result
//! - **Cancellation**: grace window for unpaid tickets, refund policy for paid ones
//! - **Invariants**: read-only consistency checks over persisted tickets
//!
//! Every status change goes through a conditional update, so any number of
//! these paths can race on the same ticket and only one of them wins.

pub mod actor;
pub mod audit;
pub mod booking;
pub mod cancellation;
pub mod config;
pub mod confirm;
pub mod email;
pub mod error;
pub mod invariants;
pub mod polling;
pub mod providers;
pub mod reconcile;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Actor
pub use actor::Actor;

// Audit
pub use audit::{AuditAction, AuditLogger, PgAuditLogger};

// Booking
pub use booking::{BookedTicket, BookingRequest, BookingService, RetryCheckoutOutcome};

// Cancellation
pub use cancellation::{
    CancellationOutcome, CancellationRequest, EventCancellationSummary, GracePeriodCanceller,
    RefundMode,
};

// Config
pub use config::{CheckoutUrls, EmailConfig, PaypalConfig, ReconcileConfig, StripeConfig};

// Confirmation
pub use confirm::{ConfirmationHints, ConfirmationStatus, ProactiveConfirmation};

// Email
pub use email::{TicketEmailService, TicketNotifier};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Polling
pub use polling::{PollSummary, PollTier, PollingReconciler, SweepSummary};

// Providers
pub use providers::{
    CheckoutSession, PaymentGateway, PaymentGateways, PaypalGateway, ProviderEvent,
    ProviderEventKind, RefundOutcome, SessionStatus, StripeGateway,
};

// Reconcile
pub use reconcile::{CheckOutcome, ConfirmOutcome, ConfirmationSource, Reconciler};

// Store
pub use store::{InMemoryTicketStore, PgTicketStore, TicketQuery, TicketStore};

// Webhooks
pub use webhooks::{WebhookAck, WebhookHandler};

use sqlx::PgPool;

/// Collaborators every ticket service is built from
pub struct ServiceDeps {
    pub store: Arc<dyn TicketStore>,
    pub gateways: PaymentGateways,
    pub notifier: Arc<dyn TicketNotifier>,
    pub audit: Arc<dyn AuditLogger>,
}

/// All ticket services wired over one store
#[derive(Clone)]
pub struct TicketingService {
    pub store: Arc<dyn TicketStore>,
    pub booking: Arc<BookingService>,
    pub webhooks: Arc<WebhookHandler>,
    pub polling: Arc<PollingReconciler>,
    pub confirmation: Arc<ProactiveConfirmation>,
    pub cancellation: Arc<GracePeriodCanceller>,
    pub config: ReconcileConfig,
}

impl TicketingService {
    /// Create the services backed by Postgres and the real providers
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = ReconcileConfig::from_env();
        let stripe = StripeGateway::from_env()?;
        let paypal = PaypalGateway::from_env()?;

        let deps = ServiceDeps {
            store: Arc::new(PgTicketStore::new(pool.clone())),
            gateways: PaymentGateways::new(
                Arc::new(stripe),
                Arc::new(paypal),
                config.provider_timeout,
            ),
            notifier: Arc::new(TicketEmailService::new(pool.clone(), EmailConfig::from_env())?),
            audit: Arc::new(PgAuditLogger::new(pool)),
        };

        Ok(Self::new(deps, config))
    }

    pub fn new(deps: ServiceDeps, config: ReconcileConfig) -> Self {
        let reconciler = Reconciler::new(deps.store.clone(), deps.gateways.clone(), deps.notifier.clone());

        Self {
            store: deps.store.clone(),
            booking: Arc::new(BookingService::new(reconciler.clone(), &config)),
            webhooks: Arc::new(WebhookHandler::new(reconciler.clone())),
            polling: Arc::new(PollingReconciler::new(reconciler.clone(), config.clone())),
            confirmation: Arc::new(ProactiveConfirmation::new(reconciler)),
            cancellation: Arc::new(GracePeriodCanceller::new(
                deps.store,
                deps.gateways,
                deps.notifier,
                deps.audit,
                config.clone(),
            )),
            config,
        }
    }
}

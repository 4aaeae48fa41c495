//! In-memory collaborators for tests
//!
//! Available to other crates through the `test-util` feature.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use eventpass_shared::{
    ConditionalUpdate, EventInfo, NewTicket, PaymentProvider, TicketRecord,
};
use reqwest::header::HeaderMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::actor::Actor;
use crate::audit::{AuditAction, AuditLogger};
use crate::cancellation::{CancellationOutcome, CancellationRequest, RefundMode};
use crate::config::ReconcileConfig;
use crate::email::TicketNotifier;
use crate::error::{BillingError, BillingResult};
use crate::providers::{
    CheckoutSession, PaymentGateway, PaymentGateways, ProviderEvent, RefundOutcome, SessionStatus,
};
use crate::store::{InMemoryTicketStore, TicketStore};
use crate::{ServiceDeps, TicketingService};

/// Header a fake webhook must carry to pass verification
pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRefund {
    pub payment_ref: String,
    pub amount_cents: i64,
    pub idempotency_key: String,
}

#[derive(Default)]
struct FakeState {
    statuses: HashMap<String, SessionStatus>,
    /// Approved but not yet captured: session id -> payment ref
    approved: HashMap<String, String>,
    webhooks: HashMap<String, ProviderEvent>,
    refunds: Vec<FakeRefund>,
    unavailable: bool,
    failing_checkouts: usize,
    failing_refunds: bool,
    failing_captures: bool,
    failing_expiry: bool,
    /// Payment that lands while an expiry is in flight
    paid_on_expiry: HashMap<String, String>,
    expired: Vec<String>,
    delay: Duration,
    next_session: u64,
}

/// Scriptable payment gateway
pub struct FakeGateway {
    provider: PaymentProvider,
    state: Mutex<FakeState>,
    checkout_calls: AtomicUsize,
    status_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new(provider: PaymentProvider) -> Self {
        Self {
            provider,
            state: Mutex::new(FakeState::default()),
            checkout_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        lock(&self.state)
            .statuses
            .insert(session_id.to_string(), status);
    }

    /// Buyer approved; only `finalize_approved` turns this into a payment
    pub fn approve(&self, session_id: &str, payment_ref: &str) {
        lock(&self.state)
            .approved
            .insert(session_id.to_string(), payment_ref.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// The next `count` checkout creations fail as unavailable
    pub fn fail_next_checkouts(&self, count: usize) {
        lock(&self.state).failing_checkouts = count;
    }

    pub fn fail_refunds(&self, failing: bool) {
        lock(&self.state).failing_refunds = failing;
    }

    /// `finalize_approved` fails while other calls keep working
    pub fn fail_captures(&self, failing: bool) {
        lock(&self.state).failing_captures = failing;
    }

    /// `expire_session` fails as unavailable
    pub fn fail_expiry(&self, failing: bool) {
        lock(&self.state).failing_expiry = failing;
    }

    /// The buyer pays `session_id` just before it can be expired
    pub fn pay_before_expiry(&self, session_id: &str, payment_ref: &str) {
        lock(&self.state)
            .paid_on_expiry
            .insert(session_id.to_string(), payment_ref.to_string());
    }

    pub fn expired_sessions(&self) -> Vec<String> {
        lock(&self.state).expired.clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    /// Make `payload` verify as `event` when signed with [`FAKE_SIGNATURE_HEADER`]
    pub fn register_webhook(&self, payload: &str, event: ProviderEvent) {
        lock(&self.state)
            .webhooks
            .insert(payload.to_string(), event);
    }

    /// Allocate a session id without going through checkout creation
    pub fn open_session(&self) -> String {
        let mut state = lock(&self.state);
        state.next_session += 1;
        let session_id = format!("{}_session_{}", self.provider, state.next_session);
        state
            .statuses
            .insert(session_id.clone(), SessionStatus::NotCompleted);
        session_id
    }

    pub fn refunds(&self) -> Vec<FakeRefund> {
        lock(&self.state).refunds.clone()
    }

    pub fn checkout_calls(&self) -> usize {
        self.checkout_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> BillingResult<()> {
        let (delay, unavailable) = {
            let state = lock(&self.state);
            (state.delay, state.unavailable)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if unavailable {
            return Err(BillingError::ProviderUnavailable(format!(
                "{} is down",
                self.provider
            )));
        }
        Ok(())
    }

    fn current_status(&self, session_id: &str) -> SessionStatus {
        lock(&self.state)
            .statuses
            .get(session_id)
            .cloned()
            .unwrap_or(SessionStatus::NotCompleted)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn provider(&self) -> PaymentProvider {
        self.provider
    }

    async fn create_checkout_session(
        &self,
        _ticket: &TicketRecord,
        _event: &EventInfo,
    ) -> BillingResult<CheckoutSession> {
        self.checkout_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;

        {
            let mut state = lock(&self.state);
            if state.failing_checkouts > 0 {
                state.failing_checkouts -= 1;
                return Err(BillingError::ProviderUnavailable(
                    "checkout creation failed".to_string(),
                ));
            }
        }

        let session_id = self.open_session();
        Ok(CheckoutSession {
            checkout_url: format!("https://pay.example.test/{session_id}"),
            session_id,
        })
    }

    async fn session_status(&self, session_id: &str) -> BillingResult<SessionStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        Ok(self.current_status(session_id))
    }

    async fn finalize_approved(&self, session_id: &str) -> BillingResult<SessionStatus> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;

        let mut state = lock(&self.state);
        if state.failing_captures {
            return Err(BillingError::ProviderUnavailable("capture failed".to_string()));
        }
        if let Some(payment_ref) = state.approved.remove(session_id) {
            let captured = SessionStatus::Completed { payment_ref };
            state
                .statuses
                .insert(session_id.to_string(), captured.clone());
            return Ok(captured);
        }
        Ok(state
            .statuses
            .get(session_id)
            .cloned()
            .unwrap_or(SessionStatus::NotCompleted))
    }

    async fn expire_session(&self, session_id: &str) -> BillingResult<SessionStatus> {
        self.pause().await?;

        let mut state = lock(&self.state);
        if state.failing_expiry {
            return Err(BillingError::ProviderUnavailable("expiry failed".to_string()));
        }

        let paid = state
            .paid_on_expiry
            .remove(session_id)
            .or_else(|| state.approved.remove(session_id));
        if let Some(payment_ref) = paid {
            let completed = SessionStatus::Completed { payment_ref };
            state
                .statuses
                .insert(session_id.to_string(), completed.clone());
            return Ok(completed);
        }

        if let Some(
            closed @ (SessionStatus::Completed { .. } | SessionStatus::Failed { .. }),
        ) = state.statuses.get(session_id).cloned()
        {
            return Ok(closed);
        }

        let expired = SessionStatus::Failed {
            reason: "checkout session expired".to_string(),
        };
        state
            .statuses
            .insert(session_id.to_string(), expired.clone());
        state.expired.push(session_id.to_string());
        Ok(expired)
    }

    async fn refund(
        &self,
        payment_ref: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> BillingResult<RefundOutcome> {
        self.pause().await?;

        let mut state = lock(&self.state);
        if state.failing_refunds {
            return Err(BillingError::ProviderUnavailable("refund failed".to_string()));
        }
        if state
            .refunds
            .iter()
            .any(|r| r.idempotency_key == idempotency_key)
        {
            return Ok(RefundOutcome::AlreadyRefunded);
        }
        state.refunds.push(FakeRefund {
            payment_ref: payment_ref.to_string(),
            amount_cents,
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(RefundOutcome::Refunded {
            refund_id: format!("re_fake_{}", state.refunds.len()),
        })
    }

    async fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &str,
    ) -> BillingResult<ProviderEvent> {
        self.pause().await?;

        let signed = headers
            .get(FAKE_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some("valid");
        if !signed {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        lock(&self.state)
            .webhooks
            .get(payload)
            .cloned()
            .ok_or_else(|| BillingError::MalformedPayload("unknown fake payload".to_string()))
    }
}

/// Notifier that records which tickets were mailed
#[derive(Default)]
pub struct RecordingNotifier {
    confirmations: Mutex<Vec<Uuid>>,
    cancellations: Mutex<Vec<Uuid>>,
}

impl RecordingNotifier {
    pub fn confirmations(&self) -> Vec<Uuid> {
        lock(&self.confirmations).clone()
    }

    pub fn cancellations(&self) -> Vec<Uuid> {
        lock(&self.cancellations).clone()
    }
}

#[async_trait]
impl TicketNotifier for RecordingNotifier {
    async fn send_payment_confirmation(&self, ticket: &TicketRecord) -> BillingResult<()> {
        lock(&self.confirmations).push(ticket.id);
        Ok(())
    }

    async fn send_cancellation_notice(&self, ticket: &TicketRecord) -> BillingResult<()> {
        lock(&self.cancellations).push(ticket.id);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub ticket_id: Uuid,
    pub details: serde_json::Value,
}

#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl AuditLogger for MemoryAuditLog {
    async fn record(
        &self,
        action: AuditAction,
        actor_id: Uuid,
        ticket_id: Uuid,
        details: serde_json::Value,
    ) -> BillingResult<()> {
        lock(&self.entries).push(AuditEntry {
            action,
            actor_id,
            ticket_id,
            details,
        });
        Ok(())
    }
}

/// A fully wired service over in-memory collaborators
pub struct TestHarness {
    pub store: InMemoryTicketStore,
    pub stripe: Arc<FakeGateway>,
    pub paypal: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<MemoryAuditLog>,
    pub service: TicketingService,
    pub config: ReconcileConfig,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ReconcileConfig::default())
    }

    pub fn with_config(config: ReconcileConfig) -> Self {
        let store = InMemoryTicketStore::new();
        let stripe = Arc::new(FakeGateway::new(PaymentProvider::Stripe));
        let paypal = Arc::new(FakeGateway::new(PaymentProvider::Paypal));
        let notifier = Arc::new(RecordingNotifier::default());
        let audit = Arc::new(MemoryAuditLog::default());

        let deps = ServiceDeps {
            store: Arc::new(store.clone()),
            gateways: PaymentGateways::new(
                stripe.clone(),
                paypal.clone(),
                config.provider_timeout,
            ),
            notifier: notifier.clone(),
            audit: audit.clone(),
        };
        let service = TicketingService::new(deps, config.clone());

        Self {
            store,
            stripe,
            paypal,
            notifier,
            audit,
            service,
            config,
        }
    }

    pub fn gateway(&self, provider: PaymentProvider) -> &Arc<FakeGateway> {
        match provider {
            PaymentProvider::Stripe => &self.stripe,
            PaymentProvider::Paypal => &self.paypal,
        }
    }

    /// Active event priced at 25.00 with a 3.00 pickup fee
    pub async fn event(&self, starts_at: OffsetDateTime, max_participants: i64) -> EventInfo {
        let event = EventInfo {
            id: Uuid::new_v4(),
            title: "Warehouse night".to_string(),
            starts_at,
            max_participants,
            price_cents: 2500,
            pickup_fee_cents: 300,
            currency: "eur".to_string(),
            is_active: true,
        };
        self.store.insert_event(event.clone()).await;
        event
    }

    /// Pending ticket with an open checkout session, as of `created_at`
    pub async fn pending_ticket(
        &self,
        event: &EventInfo,
        provider: PaymentProvider,
        created_at: OffsetDateTime,
    ) -> TicketRecord {
        let new = NewTicket::new(Uuid::new_v4(), event, provider, false, created_at)
            .expect("valid ticket");
        let ticket = self
            .store
            .insert_with_capacity(new)
            .await
            .expect("capacity available");

        let session_id = self.gateway(provider).open_session();
        self.store
            .set_checkout_session(ticket.id, &session_id, created_at)
            .await
            .expect("session stored");
        self.ticket(ticket.id).await
    }

    /// Paid ticket, confirmed at `created_at`
    pub async fn paid_ticket(
        &self,
        event: &EventInfo,
        provider: PaymentProvider,
        created_at: OffsetDateTime,
    ) -> TicketRecord {
        let ticket = self.pending_ticket(event, provider, created_at).await;
        let payment_ref = format!("pay_{}", ticket.id.simple());
        self.complete(&ticket, &payment_ref);
        self.store
            .apply(&ConditionalUpdate::confirm_payment(ticket.id, payment_ref, created_at))
            .await
            .expect("confirmation applied");
        self.ticket(ticket.id).await
    }

    /// Provider reports the ticket's checkout as paid
    pub fn complete(&self, ticket: &TicketRecord, payment_ref: &str) {
        let session_id = ticket
            .provider_session_id
            .as_deref()
            .expect("ticket has a session");
        self.gateway(ticket.payment_provider).set_status(
            session_id,
            SessionStatus::Completed {
                payment_ref: payment_ref.to_string(),
            },
        );
    }

    pub async fn ticket(&self, ticket_id: Uuid) -> TicketRecord {
        self.store
            .get_ticket(ticket_id)
            .await
            .expect("store reachable")
            .expect("ticket exists")
    }

    /// Ticket holder cancels at `at`
    pub async fn user_cancel(&self, ticket: &TicketRecord, at: OffsetDateTime) -> CancellationOutcome {
        self.service
            .cancellation
            .cancel(
                CancellationRequest {
                    ticket_id: ticket.id,
                    actor: Actor::User(ticket.user_id),
                    refund_mode: RefundMode::BestEffort,
                },
                at,
            )
            .await
            .expect("cancellation accepted")
    }
}

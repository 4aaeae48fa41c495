//! Ticket booking and checkout creation

use std::sync::Arc;

use eventpass_shared::{ConditionalUpdate, EventInfo, NewTicket, PaymentProvider, TicketRecord, TicketStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::actor::Actor;
use crate::config::ReconcileConfig;
use crate::error::{BillingError, BillingResult};
use crate::providers::{CheckoutSession, SessionStatus};
use crate::reconcile::{CheckOutcome, ConfirmOutcome, ConfirmationSource, Reconciler};
use crate::store::TicketStore;

#[derive(Debug, Clone, Deserialize)]
pub struct BookingRequest {
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub provider: PaymentProvider,
    #[serde(default)]
    pub pickup_selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookedTicket {
    pub ticket: TicketRecord,
    pub checkout_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryCheckoutOutcome {
    NewSession { checkout_url: String },
    /// The previous checkout went through after all
    AlreadyPaid,
}

pub struct BookingService {
    store: Arc<dyn TicketStore>,
    reconciler: Reconciler,
    retry_attempts: usize,
}

impl BookingService {
    pub fn new(reconciler: Reconciler, config: &ReconcileConfig) -> Self {
        Self {
            store: reconciler.store().clone(),
            reconciler,
            retry_attempts: config.checkout_retry_attempts.max(1),
        }
    }

    /// Reserve a seat and open a checkout for it
    pub async fn book(&self, request: BookingRequest, now: OffsetDateTime) -> BillingResult<BookedTicket> {
        let event = self
            .store
            .get_event(request.event_id)
            .await?
            .ok_or(BillingError::EventNotFound(request.event_id))?;
        if !event.is_bookable(now) {
            return Err(BillingError::EventClosed);
        }

        let new = NewTicket::new(
            request.user_id,
            &event,
            request.provider,
            request.pickup_selected,
            now,
        )?;
        let mut ticket = self.store.insert_with_capacity(new).await?;

        let session = match self.open_checkout(&ticket, &event).await {
            Ok(session) => session,
            Err(e) => {
                self.release(&ticket, now).await;
                return Err(e);
            }
        };

        if !self
            .store
            .set_checkout_session(ticket.id, &session.session_id, now)
            .await?
        {
            return Err(self.not_pending(ticket.id).await);
        }

        tracing::info!(
            ticket_id = %ticket.id,
            event_id = %event.id,
            user_id = %ticket.user_id,
            provider = %ticket.payment_provider,
            total_amount_cents = ticket.total_amount_cents,
            "Ticket booked"
        );

        ticket.provider_session_id = Some(session.session_id);
        ticket.updated_at = now;
        Ok(BookedTicket {
            ticket,
            checkout_url: session.checkout_url,
        })
    }

    /// New checkout for a pending ticket whose previous one was abandoned
    pub async fn retry_checkout(
        &self,
        ticket_id: Uuid,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<RetryCheckoutOutcome> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or(BillingError::TicketNotFound(ticket_id))?;
        Actor::User(user_id).authorize(&ticket)?;

        if ticket.status != TicketStatus::Pending {
            return Err(BillingError::TicketNotPending(ticket.status));
        }

        // Never hand out a second checkout for a payment that already went through
        match self
            .reconciler
            .check_ticket(&ticket, ConfirmationSource::RetryCheckout, true, now)
            .await?
        {
            CheckOutcome::Paid(ConfirmOutcome::PaidAfterCancellation) => {
                return Err(BillingError::TicketNotPending(TicketStatus::Cancelled))
            }
            CheckOutcome::Paid(_) => return Ok(RetryCheckoutOutcome::AlreadyPaid),
            CheckOutcome::NotCompleted | CheckOutcome::Failed { .. } | CheckOutcome::NoSession => {}
        }

        let event = self
            .store
            .get_event(ticket.event_id)
            .await?
            .ok_or(BillingError::EventNotFound(ticket.event_id))?;
        if !event.is_bookable(now) {
            return Err(BillingError::EventClosed);
        }

        // A payment on a replaced session would match no ticket
        if let Some(paid) = self.close_previous_checkout(&ticket, now).await? {
            return Ok(paid);
        }

        let session = self.open_checkout(&ticket, &event).await?;
        if !self
            .store
            .set_checkout_session(ticket.id, &session.session_id, now)
            .await?
        {
            return Err(self.not_pending(ticket.id).await);
        }

        tracing::info!(
            ticket_id = %ticket.id,
            provider = %ticket.payment_provider,
            previous_session = ?ticket.provider_session_id,
            session_id = %session.session_id,
            "Checkout session replaced"
        );
        Ok(RetryCheckoutOutcome::NewSession {
            checkout_url: session.checkout_url,
        })
    }

    /// Expire the ticket's current session at the provider
    ///
    /// Returns an outcome when the buyer paid the old session before it closed.
    async fn close_previous_checkout(
        &self,
        ticket: &TicketRecord,
        now: OffsetDateTime,
    ) -> BillingResult<Option<RetryCheckoutOutcome>> {
        let Some(session_id) = ticket.provider_session_id.as_deref() else {
            return Ok(None);
        };

        let status = self
            .reconciler
            .gateways()
            .expire_session(ticket.payment_provider, session_id)
            .await
            .map_err(|e| {
                tracing::warn!(
                    ticket_id = %ticket.id,
                    session_id = %session_id,
                    error = %e,
                    "Could not expire previous checkout, keeping it"
                );
                e
            })?;

        match status {
            SessionStatus::Completed { payment_ref } => {
                match self
                    .reconciler
                    .apply_confirmation(
                        ticket,
                        &payment_ref,
                        ConfirmationSource::RetryCheckout,
                        now,
                    )
                    .await?
                {
                    ConfirmOutcome::Confirmed | ConfirmOutcome::AlreadyConfirmed => {
                        Ok(Some(RetryCheckoutOutcome::AlreadyPaid))
                    }
                    ConfirmOutcome::PaidAfterCancellation => {
                        Err(BillingError::TicketNotPending(TicketStatus::Cancelled))
                    }
                    ConfirmOutcome::TicketMissing => Err(BillingError::TicketNotFound(ticket.id)),
                }
            }
            SessionStatus::Failed { .. } => Ok(None),
            SessionStatus::NotCompleted => Err(BillingError::ProviderUnavailable(format!(
                "{} session {session_id} is still open",
                ticket.payment_provider
            ))),
        }
    }

    async fn open_checkout(&self, ticket: &TicketRecord, event: &EventInfo) -> BillingResult<CheckoutSession> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(std::time::Duration::from_secs(2))
            .map(jitter)
            .take(self.retry_attempts - 1);

        let gateways = self.reconciler.gateways();
        RetryIf::spawn(
            strategy,
            move || async move {
                gateways
                    .create_checkout_session(ticket, event)
                    .await
                    .map_err(|e| {
                        tracing::warn!(
                            ticket_id = %ticket.id,
                            provider = %ticket.payment_provider,
                            error = %e,
                            "Checkout creation failed"
                        );
                        e
                    })
            },
            |e: &BillingError| matches!(e, BillingError::ProviderUnavailable(_)),
        )
        .await
    }

    /// Give the seat back after checkout creation failed for good
    async fn release(&self, ticket: &TicketRecord, now: OffsetDateTime) {
        match self
            .store
            .apply(&ConditionalUpdate::abandon_unpaid(ticket.id, now))
            .await
        {
            Ok(_) => tracing::info!(
                ticket_id = %ticket.id,
                event_id = %ticket.event_id,
                "Released seat after checkout creation failed"
            ),
            Err(e) => tracing::error!(
                ticket_id = %ticket.id,
                error = %e,
                "Failed to release seat, stale sweep will cancel the ticket"
            ),
        }
    }

    async fn not_pending(&self, ticket_id: Uuid) -> BillingError {
        match self.store.get_ticket(ticket_id).await {
            Ok(Some(current)) => BillingError::TicketNotPending(current.status),
            Ok(None) => BillingError::TicketNotFound(ticket_id),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PaymentGateway;
    use crate::testing::TestHarness;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2030-07-01 10:00 UTC);

    fn request(user_id: Uuid, event: &EventInfo, provider: PaymentProvider) -> BookingRequest {
        BookingRequest {
            user_id,
            event_id: event.id,
            provider,
            pickup_selected: true,
        }
    }

    #[tokio::test]
    async fn test_booking_creates_pending_ticket_with_session() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        let user = Uuid::new_v4();

        let booked = h
            .service
            .booking
            .book(request(user, &event, PaymentProvider::Stripe), NOW)
            .await
            .unwrap();

        assert_eq!(booked.ticket.status, TicketStatus::Pending);
        assert_eq!(booked.ticket.total_amount_cents, 2800);
        let session = booked.ticket.provider_session_id.clone().unwrap();
        assert!(booked.checkout_url.ends_with(&session));

        let stored = h.ticket(booked.ticket.id).await;
        assert_eq!(stored.provider_session_id, Some(session));
        assert_eq!(h.store.count_reserved(event.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_booking_rejects_started_or_unknown_event() {
        let h = TestHarness::new();
        let past = h.event(NOW - Duration::hours(1), 5).await;

        let closed = h
            .service
            .booking
            .book(request(Uuid::new_v4(), &past, PaymentProvider::Stripe), NOW)
            .await;
        assert!(matches!(closed, Err(BillingError::EventClosed)));

        let unknown = h
            .service
            .booking
            .book(
                BookingRequest {
                    user_id: Uuid::new_v4(),
                    event_id: Uuid::new_v4(),
                    provider: PaymentProvider::Paypal,
                    pickup_selected: false,
                },
                NOW,
            )
            .await;
        assert!(matches!(unknown, Err(BillingError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_sold_out_event() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 1).await;
        h.service
            .booking
            .book(request(Uuid::new_v4(), &event, PaymentProvider::Stripe), NOW)
            .await
            .unwrap();

        let second = h
            .service
            .booking
            .book(request(Uuid::new_v4(), &event, PaymentProvider::Paypal), NOW)
            .await;
        assert!(matches!(second, Err(BillingError::CapacityExceeded)));
    }

    #[tokio::test]
    async fn test_transient_checkout_failure_is_retried() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        h.paypal.fail_next_checkouts(2);

        let booked = h
            .service
            .booking
            .book(request(Uuid::new_v4(), &event, PaymentProvider::Paypal), NOW)
            .await
            .unwrap();
        assert_eq!(h.paypal.checkout_calls(), 3);
        assert!(booked.ticket.provider_session_id.is_some());
    }

    #[tokio::test]
    async fn test_failed_checkout_releases_seat() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 1).await;
        h.stripe.set_unavailable(true);

        let result = h
            .service
            .booking
            .book(request(Uuid::new_v4(), &event, PaymentProvider::Stripe), NOW)
            .await;
        assert!(matches!(result, Err(BillingError::ProviderUnavailable(_))));
        assert_eq!(h.stripe.checkout_calls(), 3);
        assert_eq!(h.store.count_reserved(event.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_checkout_swaps_session() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(20)).await;
        let old_session = ticket.provider_session_id.clone().unwrap();

        let outcome = h
            .service
            .booking
            .retry_checkout(ticket.id, ticket.user_id, NOW)
            .await
            .unwrap();
        assert!(matches!(outcome, RetryCheckoutOutcome::NewSession { .. }));

        let stored = h.ticket(ticket.id).await;
        assert_ne!(stored.provider_session_id, Some(old_session));
        assert_eq!(stored.updated_at, NOW);
    }

    #[tokio::test]
    async fn test_retry_checkout_expires_old_session() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(20)).await;
        let old_session = ticket.provider_session_id.clone().unwrap();

        h.service
            .booking
            .retry_checkout(ticket.id, ticket.user_id, NOW)
            .await
            .unwrap();

        assert_eq!(h.stripe.expired_sessions(), vec![old_session.clone()]);
        assert!(matches!(
            h.stripe.session_status(&old_session).await.unwrap(),
            SessionStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_payment_racing_retry_confirms_old_session() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(20)).await;
        let old_session = ticket.provider_session_id.clone().unwrap();
        h.stripe.pay_before_expiry(&old_session, "pi_old");

        let outcome = h
            .service
            .booking
            .retry_checkout(ticket.id, ticket.user_id, NOW)
            .await
            .unwrap();
        assert_eq!(outcome, RetryCheckoutOutcome::AlreadyPaid);
        assert_eq!(h.stripe.checkout_calls(), 0);

        let stored = h.ticket(ticket.id).await;
        assert_eq!(stored.status, TicketStatus::Paid);
        assert_eq!(stored.provider_payment_ref.as_deref(), Some("pi_old"));
        assert_eq!(stored.provider_session_id, Some(old_session));

        // Nothing left for the sweep to cancel
        let summary = h
            .service
            .polling
            .sweep_stale_pending(NOW + Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(summary.cancelled, 0);
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Paid);
    }

    #[tokio::test]
    async fn test_retry_fails_when_old_session_cannot_be_expired() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Paypal, NOW - Duration::minutes(20)).await;
        h.paypal.fail_expiry(true);

        let result = h
            .service
            .booking
            .retry_checkout(ticket.id, ticket.user_id, NOW)
            .await;
        assert!(matches!(result, Err(BillingError::ProviderUnavailable(_))));
        assert_eq!(h.paypal.checkout_calls(), 0);

        let stored = h.ticket(ticket.id).await;
        assert_eq!(stored.provider_session_id, ticket.provider_session_id);
        assert_eq!(stored.status, TicketStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_checkout_detects_completed_payment() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(20)).await;
        h.complete(&ticket, "pi_done");

        let outcome = h
            .service
            .booking
            .retry_checkout(ticket.id, ticket.user_id, NOW)
            .await
            .unwrap();
        assert_eq!(outcome, RetryCheckoutOutcome::AlreadyPaid);
        assert_eq!(h.stripe.checkout_calls(), 0);
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Paid);
    }

    #[tokio::test]
    async fn test_retry_checkout_requires_pending_owned_ticket() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(10), 5).await;
        let paid = h.paid_ticket(&event, PaymentProvider::Paypal, NOW - Duration::hours(1)).await;

        let not_pending = h
            .service
            .booking
            .retry_checkout(paid.id, paid.user_id, NOW)
            .await;
        assert!(matches!(
            not_pending,
            Err(BillingError::TicketNotPending(TicketStatus::Paid))
        ));

        let foreign = h
            .service
            .booking
            .retry_checkout(paid.id, Uuid::new_v4(), NOW)
            .await;
        assert!(matches!(foreign, Err(BillingError::NotTicketOwner)));
    }
}

// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Ticket Reconciliation
//!
//! Races between reconcilers and boundary conditions of the lifecycle:
//! - Concurrent confirmation (TKT-C01 to TKT-C03)
//! - Grace window (TKT-G01 to TKT-G04)
//! - Refunds (TKT-R01 to TKT-R04)
//! - Capacity (TKT-K01 to TKT-K02)
//! - Webhooks (TKT-W01 to TKT-W02)

#[cfg(test)]
mod confirmation_race_tests {
    use std::sync::Arc;

    use eventpass_shared::{PaymentProvider, TicketStatus};
    use reqwest::header::{HeaderMap, HeaderValue};
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use tokio::sync::Barrier;

    use crate::actor::Actor;
    use crate::confirm::{ConfirmationHints, ConfirmationStatus};
    use crate::polling::PollTier;
    use crate::providers::{ProviderEvent, ProviderEventKind};
    use crate::testing::{TestHarness, FAKE_SIGNATURE_HEADER};

    const NOW: OffsetDateTime = datetime!(2030-09-01 19:00 UTC);

    // =========================================================================
    // TKT-C01: webhook and fast poll see the same completed payment
    // =========================================================================
    #[tokio::test]
    async fn test_webhook_and_poll_confirm_once() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(20), 10).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::seconds(10)).await;
        let session = ticket.provider_session_id.clone().unwrap();
        h.complete(&ticket, "pi_race");
        h.stripe.register_webhook(
            "race",
            ProviderEvent {
                event_id: "evt_race".to_string(),
                event_type: "checkout.session.completed".to_string(),
                kind: ProviderEventKind::PaymentCompleted {
                    session_id: session,
                    payment_ref: "pi_race".to_string(),
                },
            },
        );

        let barrier = Arc::new(Barrier::new(2));

        let webhook = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let mut headers = HeaderMap::new();
                headers.insert(FAKE_SIGNATURE_HEADER, HeaderValue::from_static("valid"));
                barrier.wait().await;
                service
                    .webhooks
                    .handle(PaymentProvider::Stripe, &headers, "race", NOW)
                    .await
            })
        };
        let poll = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                service.polling.run_tier(PollTier::Fast, NOW).await
            })
        };

        webhook.await.unwrap().unwrap();
        poll.await.unwrap().unwrap();

        let stored = h.ticket(ticket.id).await;
        assert_eq!(stored.status, TicketStatus::Paid);
        assert_eq!(stored.provider_payment_ref.as_deref(), Some("pi_race"));
        assert_eq!(h.notifier.confirmations(), vec![ticket.id], "exactly one e-mail");
    }

    // =========================================================================
    // TKT-C02: parallel proactive confirmations all report paid, one e-mail
    // =========================================================================
    #[tokio::test]
    async fn test_parallel_proactive_confirmations() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(20), 10).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Paypal, NOW - Duration::seconds(20)).await;
        h.paypal
            .approve(ticket.provider_session_id.as_deref().unwrap(), "CAP-PAR");

        let barrier = Arc::new(Barrier::new(5));
        let mut handles = vec![];
        for _ in 0..5 {
            let service = h.service.clone();
            let barrier = barrier.clone();
            let ticket_id = ticket.id;
            let actor = Actor::User(ticket.user_id);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .confirmation
                    .confirm(ticket_id, actor, ConfirmationHints::default(), NOW)
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), ConfirmationStatus::Paid);
        }
        assert_eq!(h.notifier.confirmations().len(), 1);
    }

    // =========================================================================
    // TKT-C03: a confirmation never moves a ticket back to pending
    // =========================================================================
    #[tokio::test]
    async fn test_status_never_returns_to_pending() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(20), 10).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::seconds(5)).await;

        h.user_cancel(&ticket, NOW).await;
        h.complete(&ticket, "pi_back");
        h.service.polling.run_tier(PollTier::Grace, NOW + Duration::seconds(10)).await.unwrap();
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Paid);

        h.service.polling.run_tier(PollTier::Fast, NOW + Duration::seconds(15)).await.unwrap();
        h.service
            .polling
            .sweep_stale_pending(NOW + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Paid);
    }
}

#[cfg(test)]
mod grace_window_tests {
    use std::sync::Arc;

    use eventpass_shared::{PaymentProvider, TicketStatus};
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::actor::Actor;
    use crate::cancellation::{CancellationOutcome, CancellationRequest, RefundMode};
    use crate::polling::PollTier;
    use crate::store::TicketStore;
    use crate::testing::TestHarness;

    const NOW: OffsetDateTime = datetime!(2030-09-01 19:00 UTC);

    // =========================================================================
    // TKT-G01: payment completing inside the window reactivates the ticket
    // =========================================================================
    #[tokio::test]
    async fn test_payment_inside_grace_window_reactivates() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(20), 10).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Paypal, NOW - Duration::minutes(2)).await;

        h.user_cancel(&ticket, NOW).await;
        h.complete(&ticket, "CAP-G01");

        let summary = h
            .service
            .polling
            .run_tier(PollTier::Grace, NOW + Duration::minutes(4))
            .await
            .unwrap();
        assert_eq!(summary.confirmed, 1);

        // The sweep after the deadline finds nothing left to cancel
        let sweep = h
            .service
            .polling
            .finalize_grace_periods(NOW + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(sweep.examined, 0);
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Paid);
        assert!(h.notifier.cancellations().is_empty());
    }

    // =========================================================================
    // TKT-G02: window expiry on a simulated clock releases the seat
    // =========================================================================
    #[tokio::test]
    async fn test_grace_expiry_releases_capacity() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(20), 3).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(2)).await;
        h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(1)).await;

        h.user_cancel(&ticket, NOW).await;
        assert_eq!(h.store.count_reserved(event.id).await.unwrap(), 2);

        let mut clock = NOW;
        while clock < NOW + Duration::minutes(5) {
            clock += Duration::seconds(60);
            h.service.polling.finalize_grace_periods(clock).await.unwrap();
        }

        let stored = h.ticket(ticket.id).await;
        assert_eq!(stored.status, TicketStatus::Cancelled);
        assert_eq!(stored.cancelled_at, Some(NOW + Duration::minutes(5)));
        assert_eq!(h.store.count_reserved(event.id).await.unwrap(), 1);
        assert_eq!(h.notifier.cancellations(), vec![ticket.id]);
    }

    // =========================================================================
    // TKT-G03: grace window survives a restart (derived from persisted state)
    // =========================================================================
    #[tokio::test]
    async fn test_grace_deadline_comes_from_stored_ticket() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(20), 3).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(2)).await;
        h.user_cancel(&ticket, NOW).await;

        let stored = h.ticket(ticket.id).await;
        assert_eq!(
            stored.grace_deadline(h.config.grace_window),
            Some(NOW + Duration::minutes(5))
        );
    }

    // =========================================================================
    // TKT-G04: admin cancel racing a confirmation settles on one final state
    // =========================================================================
    #[tokio::test]
    async fn test_admin_cancel_races_grace_confirmation() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(20), 3).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(2)).await;
        h.user_cancel(&ticket, NOW).await;
        h.complete(&ticket, "pi_g04");

        let barrier = Arc::new(Barrier::new(2));
        let admin = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            let ticket_id = ticket.id;
            tokio::spawn(async move {
                barrier.wait().await;
                service
                    .cancellation
                    .cancel(
                        CancellationRequest {
                            ticket_id,
                            actor: Actor::Admin(Uuid::new_v4()),
                            refund_mode: RefundMode::BestEffort,
                        },
                        NOW + Duration::minutes(1),
                    )
                    .await
            })
        };
        let poll = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                service
                    .polling
                    .run_tier(PollTier::Grace, NOW + Duration::minutes(1))
                    .await
            })
        };

        let cancel_outcome = admin.await.unwrap().unwrap();
        poll.await.unwrap().unwrap();

        let stored = h.ticket(ticket.id).await;
        match stored.status {
            // Admin lost the race to the confirmation, then refunded the paid ticket
            TicketStatus::Refunded => {
                assert!(matches!(cancel_outcome, CancellationOutcome::Refunded { .. }));
                assert_eq!(h.notifier.confirmations().len(), 1);
                assert_eq!(h.stripe.refunds().len(), 1);
            }
            // Admin won; the late payment is left for manual refund
            TicketStatus::Cancelled => {
                assert!(matches!(cancel_outcome, CancellationOutcome::Cancelled { .. }));
                assert!(h.notifier.confirmations().is_empty());
            }
            other => panic!("unexpected final status {other}"),
        }
        assert_eq!(h.notifier.cancellations().len(), 1);
    }
}

#[cfg(test)]
mod refund_tests {
    use std::sync::Arc;

    use eventpass_shared::{PaymentProvider, TicketStatus};
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::actor::Actor;
    use crate::cancellation::{CancellationOutcome, CancellationRequest, RefundMode};
    use crate::testing::TestHarness;

    const NOW: OffsetDateTime = datetime!(2030-09-01 19:00 UTC);

    // =========================================================================
    // TKT-R01: exactly at the 7-day cutoff the refund is still granted
    // =========================================================================
    #[tokio::test]
    async fn test_refund_at_cutoff_boundary() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(7), 10).await;
        let ticket = h.paid_ticket(&event, PaymentProvider::Stripe, NOW - Duration::days(1)).await;

        let outcome = h.user_cancel(&ticket, NOW).await;
        assert_eq!(outcome, CancellationOutcome::Refunded { refunded_amount_cents: 1250 });
    }

    // =========================================================================
    // TKT-R02: one second past the cutoff nothing is refunded
    // =========================================================================
    #[tokio::test]
    async fn test_no_refund_past_cutoff() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(7) - Duration::seconds(1), 10).await;
        let ticket = h.paid_ticket(&event, PaymentProvider::Stripe, NOW - Duration::days(1)).await;

        let outcome = h.user_cancel(&ticket, NOW).await;
        assert_eq!(outcome, CancellationOutcome::Cancelled { refunded_amount_cents: 0 });
        assert!(h.stripe.refunds().is_empty());
    }

    // =========================================================================
    // TKT-R03: concurrent cancellations of a paid ticket refund once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_cancellations_refund_once() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(30), 10).await;
        let ticket = h.paid_ticket(&event, PaymentProvider::Paypal, NOW - Duration::days(1)).await;

        let barrier = Arc::new(Barrier::new(3));
        let mut handles = vec![];
        for actor in [
            Actor::User(ticket.user_id),
            Actor::Admin(Uuid::new_v4()),
            Actor::User(ticket.user_id),
        ] {
            let service = h.service.clone();
            let barrier = barrier.clone();
            let ticket_id = ticket.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .cancellation
                    .cancel(
                        CancellationRequest {
                            ticket_id,
                            actor,
                            refund_mode: RefundMode::BestEffort,
                        },
                        NOW,
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                CancellationOutcome::Refunded { .. } => winners += 1,
                CancellationOutcome::AlreadyFinal { status } => {
                    assert_eq!(status, TicketStatus::Refunded)
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(h.paypal.refunds().len(), 1, "one provider refund");
        assert_eq!(h.notifier.cancellations().len(), 1);
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Refunded);
    }

    // =========================================================================
    // TKT-R04: a failed refund can be retried once the provider recovers
    // =========================================================================
    #[tokio::test]
    async fn test_refund_retry_after_outage() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(30), 10).await;
        let ticket = h.paid_ticket(&event, PaymentProvider::Stripe, NOW - Duration::days(1)).await;
        let request = || CancellationRequest {
            ticket_id: ticket.id,
            actor: Actor::Admin(Uuid::new_v4()),
            refund_mode: RefundMode::Required,
        };

        h.stripe.fail_refunds(true);
        assert!(h.service.cancellation.cancel(request(), NOW).await.is_err());
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Paid);

        h.stripe.fail_refunds(false);
        let outcome = h.service.cancellation.cancel(request(), NOW).await.unwrap();
        assert_eq!(outcome, CancellationOutcome::Refunded { refunded_amount_cents: 2500 });
        assert!(h.audit.entries().len() == 1, "only the successful cancellation is audited");
    }
}

#[cfg(test)]
mod capacity_tests {
    use std::sync::Arc;

    use eventpass_shared::PaymentProvider;
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::booking::BookingRequest;
    use crate::error::BillingError;
    use crate::store::TicketStore;
    use crate::testing::TestHarness;

    const NOW: OffsetDateTime = datetime!(2030-09-01 19:00 UTC);

    // =========================================================================
    // TKT-K01: two concurrent bookings for the last seat, exactly one wins
    // =========================================================================
    #[tokio::test]
    async fn test_last_seat_goes_to_one_booking() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(5), 1).await;

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for provider in [PaymentProvider::Stripe, PaymentProvider::Paypal] {
            let service = h.service.clone();
            let barrier = barrier.clone();
            let event_id = event.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .booking
                    .book(
                        BookingRequest {
                            user_id: Uuid::new_v4(),
                            event_id,
                            provider,
                            pickup_selected: false,
                        },
                        NOW,
                    )
                    .await
            }));
        }

        let mut booked = 0;
        let mut sold_out = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => booked += 1,
                Err(BillingError::CapacityExceeded) => sold_out += 1,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert_eq!((booked, sold_out), (1, 1));
        assert_eq!(h.store.count_reserved(event.id).await.unwrap(), 1);
    }

    // =========================================================================
    // TKT-K02: a ticket in its grace window still holds its seat
    // =========================================================================
    #[tokio::test]
    async fn test_grace_ticket_blocks_booking() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(5), 1).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Stripe, NOW - Duration::minutes(1)).await;
        h.user_cancel(&ticket, NOW).await;

        let result = h
            .service
            .booking
            .book(
                BookingRequest {
                    user_id: Uuid::new_v4(),
                    event_id: event.id,
                    provider: PaymentProvider::Stripe,
                    pickup_selected: false,
                },
                NOW + Duration::minutes(1),
            )
            .await;
        assert!(matches!(result, Err(BillingError::CapacityExceeded)));

        h.service
            .polling
            .finalize_grace_periods(NOW + Duration::minutes(5))
            .await
            .unwrap();
        let retry = h
            .service
            .booking
            .book(
                BookingRequest {
                    user_id: Uuid::new_v4(),
                    event_id: event.id,
                    provider: PaymentProvider::Stripe,
                    pickup_selected: false,
                },
                NOW + Duration::minutes(6),
            )
            .await;
        assert!(retry.is_ok());
    }
}

#[cfg(test)]
mod webhook_tests {
    use eventpass_shared::{PaymentProvider, TicketStatus};
    use reqwest::header::{HeaderMap, HeaderValue};
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    use crate::providers::{ProviderEvent, ProviderEventKind};
    use crate::testing::{TestHarness, FAKE_SIGNATURE_HEADER};
    use crate::webhooks::WebhookAck;

    const NOW: OffsetDateTime = datetime!(2030-09-01 19:00 UTC);

    fn signed() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(FAKE_SIGNATURE_HEADER, HeaderValue::from_static("valid"));
        headers
    }

    // =========================================================================
    // TKT-W01: capture failure is acked, then reprocessed on redelivery
    // =========================================================================
    #[tokio::test]
    async fn test_capture_failure_is_acknowledged_and_retried_later() {
        let h = TestHarness::new();
        let event = h.event(NOW + Duration::days(5), 5).await;
        let ticket = h.pending_ticket(&event, PaymentProvider::Paypal, NOW).await;
        let order_id = ticket.provider_session_id.clone().unwrap();
        h.paypal.register_webhook(
            "approved",
            ProviderEvent {
                event_id: "WH-W01".to_string(),
                event_type: "CHECKOUT.ORDER.APPROVED".to_string(),
                kind: ProviderEventKind::CheckoutApproved {
                    session_id: order_id.clone(),
                },
            },
        );
        h.paypal.approve(&order_id, "CAP-W01");
        h.paypal.fail_captures(true);

        let ack = h
            .service
            .webhooks
            .handle(PaymentProvider::Paypal, &signed(), "approved", NOW)
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::ProcessingFailed);
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Pending);

        // The failed event is reclaimed on redelivery
        h.paypal.fail_captures(false);
        let again = h
            .service
            .webhooks
            .handle(PaymentProvider::Paypal, &signed(), "approved", NOW + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(again, WebhookAck::Processed);
        assert_eq!(h.ticket(ticket.id).await.status, TicketStatus::Paid);

        let third = h
            .service
            .webhooks
            .handle(PaymentProvider::Paypal, &signed(), "approved", NOW + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(third, WebhookAck::Duplicate);
    }

    // =========================================================================
    // TKT-W02: an unreachable provider during verification is a retryable error
    // =========================================================================
    #[tokio::test]
    async fn test_verification_outage_is_not_acknowledged() {
        let h = TestHarness::new();
        h.stripe.set_unavailable(true);

        let result = h
            .service
            .webhooks
            .handle(PaymentProvider::Stripe, &signed(), "anything", NOW)
            .await;
        assert!(result.unwrap_err().is_retryable());
    }
}

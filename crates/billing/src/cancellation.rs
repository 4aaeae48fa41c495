//! Ticket cancellation
//!
//! Users cancelling an unpaid ticket get a grace window during which a late
//! payment still reactivates the ticket; the grace-finalize sweep closes it
//! afterwards. Paid tickets go through the refund policy, with the provider
//! refund issued before the ticket leaves `paid`.

use std::sync::Arc;

use eventpass_shared::{refund_decision, ConditionalUpdate, TicketRecord, TicketStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::actor::Actor;
use crate::audit::{AuditAction, AuditLogger};
use crate::config::ReconcileConfig;
use crate::email::TicketNotifier;
use crate::error::{BillingError, BillingResult};
use crate::providers::{refund_idempotency_key, PaymentGateways, RefundOutcome};
use crate::store::TicketStore;

/// A lost conditional write re-reads the ticket; the lifecycle graph is
/// short enough that this always settles
const MAX_ATTEMPTS: usize = 4;

/// What to do when a paid ticket is not eligible for a refund
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundMode {
    /// Cancel anyway, refunding nothing
    #[default]
    BestEffort,
    /// Refuse the cancellation
    Required,
}

#[derive(Debug, Clone)]
pub struct CancellationRequest {
    pub ticket_id: Uuid,
    pub actor: Actor,
    pub refund_mode: RefundMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancellationOutcome {
    GracePeriodStarted {
        #[serde(with = "time::serde::rfc3339")]
        deadline: OffsetDateTime,
    },
    Cancelled {
        refunded_amount_cents: i64,
    },
    Refunded {
        refunded_amount_cents: i64,
    },
    AlreadyFinal {
        status: TicketStatus,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct EventCancellationSummary {
    pub examined: usize,
    pub cancelled: usize,
    pub refunded: usize,
    pub refunded_amount_cents: i64,
    pub already_final: usize,
    pub errors: usize,
}

enum Step {
    Done(CancellationOutcome),
    /// Another actor changed the ticket first
    Lost,
}

pub struct GracePeriodCanceller {
    store: Arc<dyn TicketStore>,
    gateways: PaymentGateways,
    notifier: Arc<dyn TicketNotifier>,
    audit: Arc<dyn AuditLogger>,
    config: ReconcileConfig,
}

impl GracePeriodCanceller {
    pub fn new(
        store: Arc<dyn TicketStore>,
        gateways: PaymentGateways,
        notifier: Arc<dyn TicketNotifier>,
        audit: Arc<dyn AuditLogger>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            gateways,
            notifier,
            audit,
            config,
        }
    }

    pub async fn cancel(
        &self,
        request: CancellationRequest,
        now: OffsetDateTime,
    ) -> BillingResult<CancellationOutcome> {
        for attempt in 1..=MAX_ATTEMPTS {
            let ticket = self
                .store
                .get_ticket(request.ticket_id)
                .await?
                .ok_or(BillingError::TicketNotFound(request.ticket_id))?;
            request.actor.authorize(&ticket)?;

            match self.attempt(&ticket, &request, now).await? {
                Step::Done(outcome) => return Ok(outcome),
                Step::Lost => {
                    tracing::debug!(
                        ticket_id = %ticket.id,
                        status = %ticket.status,
                        attempt = attempt,
                        "Cancellation lost a concurrent update, re-reading ticket"
                    );
                }
            }
        }

        Err(BillingError::Inconsistent(format!(
            "ticket {} kept changing during cancellation",
            request.ticket_id
        )))
    }

    async fn attempt(
        &self,
        ticket: &TicketRecord,
        request: &CancellationRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Step> {
        let actor = request.actor;

        match ticket.status {
            TicketStatus::Cancelled | TicketStatus::Refunded => {
                Ok(Step::Done(CancellationOutcome::AlreadyFinal {
                    status: ticket.status,
                }))
            }
            TicketStatus::Pending if !actor.is_privileged() => {
                let update = ConditionalUpdate::request_cancellation(ticket.id, now);
                if !self.store.apply(&update).await? {
                    return Ok(Step::Lost);
                }
                let deadline = now + self.config.grace_window;
                tracing::info!(
                    ticket_id = %ticket.id,
                    user_id = %ticket.user_id,
                    deadline = %deadline,
                    "Grace period started"
                );
                Ok(Step::Done(CancellationOutcome::GracePeriodStarted { deadline }))
            }
            TicketStatus::PendingCancellation if !actor.is_privileged() => {
                let deadline = ticket
                    .grace_deadline(self.config.grace_window)
                    .unwrap_or(ticket.updated_at + self.config.grace_window);
                Ok(Step::Done(CancellationOutcome::GracePeriodStarted { deadline }))
            }
            TicketStatus::Pending | TicketStatus::PendingCancellation => {
                let update = if ticket.status == TicketStatus::Pending {
                    ConditionalUpdate::abandon_unpaid(ticket.id, now)
                } else {
                    ConditionalUpdate::expire_grace(ticket.id, now)
                };
                if !self.store.apply(&update).await? {
                    return Ok(Step::Lost);
                }
                self.after_cancellation(ticket, &update, actor).await;
                Ok(Step::Done(CancellationOutcome::Cancelled {
                    refunded_amount_cents: 0,
                }))
            }
            TicketStatus::Paid => self.cancel_paid(ticket, request, now).await,
        }
    }

    async fn cancel_paid(
        &self,
        ticket: &TicketRecord,
        request: &CancellationRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Step> {
        let event = self
            .store
            .get_event(ticket.event_id)
            .await?
            .ok_or(BillingError::EventNotFound(ticket.event_id))?;

        let decision = refund_decision(
            ticket.total_amount_cents,
            event.starts_at,
            now,
            request.actor.initiator(),
        );

        if !decision.eligible && request.refund_mode == RefundMode::Required {
            return Err(BillingError::RefundNotEligible);
        }

        let update = if decision.amount_cents > 0 {
            let payment_ref = ticket.provider_payment_ref.as_deref().ok_or_else(|| {
                BillingError::Inconsistent(format!("paid ticket {} has no payment reference", ticket.id))
            })?;

            let outcome = self
                .gateways
                .refund(
                    ticket.payment_provider,
                    payment_ref,
                    decision.amount_cents,
                    &refund_idempotency_key(ticket.id),
                )
                .await
                .map_err(|e| {
                    tracing::error!(
                        ticket_id = %ticket.id,
                        provider = %ticket.payment_provider,
                        amount_cents = decision.amount_cents,
                        error = %e,
                        "Refund failed, ticket stays paid"
                    );
                    e
                })?;

            match outcome {
                RefundOutcome::Refunded { refund_id } => tracing::info!(
                    ticket_id = %ticket.id,
                    provider = %ticket.payment_provider,
                    refund_id = %refund_id,
                    amount_cents = decision.amount_cents,
                    "Refund issued"
                ),
                RefundOutcome::AlreadyRefunded => tracing::info!(
                    ticket_id = %ticket.id,
                    provider = %ticket.payment_provider,
                    "Provider reports payment already refunded"
                ),
            }

            ConditionalUpdate::refund_paid(ticket.id, decision.amount_cents, now)
        } else {
            ConditionalUpdate::cancel_paid(ticket.id, now)
        };

        if !self.store.apply(&update).await? {
            return Ok(Step::Lost);
        }
        self.after_cancellation(ticket, &update, request.actor).await;

        let refunded_amount_cents = update.refunded_amount_cents;
        Ok(Step::Done(if update.target() == TicketStatus::Refunded {
            CancellationOutcome::Refunded {
                refunded_amount_cents,
            }
        } else {
            CancellationOutcome::Cancelled {
                refunded_amount_cents: 0,
            }
        }))
    }

    /// Side effects for the actor whose write won
    async fn after_cancellation(&self, before: &TicketRecord, update: &ConditionalUpdate, actor: Actor) {
        let mut after = before.clone();
        update.apply_to(&mut after);

        tracing::info!(
            ticket_id = %after.id,
            from = %before.status,
            to = %after.status,
            initiator = ?actor.initiator(),
            refunded_amount_cents = after.refunded_amount_cents,
            "Ticket cancelled"
        );

        if let Err(e) = self.notifier.send_cancellation_notice(&after).await {
            tracing::error!(ticket_id = %after.id, error = %e, "Failed to send cancellation notice");
        }

        let action = match actor {
            Actor::User(_) => return,
            Actor::Admin(_) => AuditAction::AdminCancelTicket,
            Actor::EventCancellation { .. } => AuditAction::EventCancelTicket,
        };
        let details = json!({
            "previous_status": before.status,
            "new_status": after.status,
            "refunded_amount_cents": after.refunded_amount_cents,
            "event_id": after.event_id,
        });
        if let Err(e) = self.audit.record(action, actor.id(), after.id, details).await {
            tracing::error!(ticket_id = %after.id, action = %action, error = %e, "Failed to write audit entry");
        }
    }

    /// Cancel every ticket still holding a seat at an event
    pub async fn cancel_event(
        &self,
        event_id: Uuid,
        admin_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<EventCancellationSummary> {
        if self.store.get_event(event_id).await?.is_none() {
            return Err(BillingError::EventNotFound(event_id));
        }

        let tickets = self
            .store
            .list_event_tickets(event_id, &TicketStatus::RESERVING)
            .await?;
        let mut summary = EventCancellationSummary::default();

        for ticket in &tickets {
            summary.examined += 1;
            let request = CancellationRequest {
                ticket_id: ticket.id,
                actor: Actor::EventCancellation { admin_id },
                refund_mode: RefundMode::BestEffort,
            };

            match self.cancel(request, now).await {
                Ok(CancellationOutcome::Refunded {
                    refunded_amount_cents,
                }) => {
                    summary.refunded += 1;
                    summary.refunded_amount_cents += refunded_amount_cents;
                }
                Ok(CancellationOutcome::Cancelled { .. }) => summary.cancelled += 1,
                Ok(CancellationOutcome::AlreadyFinal { .. }) => summary.already_final += 1,
                Ok(CancellationOutcome::GracePeriodStarted { .. }) => {
                    // Unreachable for a privileged actor, counted as an error if it happens
                    summary.errors += 1;
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        ticket_id = %ticket.id,
                        event_id = %event_id,
                        error = %e,
                        "Failed to cancel ticket of cancelled event"
                    );
                }
            }
        }

        tracing::info!(
            event_id = %event_id,
            admin_id = %admin_id,
            examined = summary.examined,
            cancelled = summary.cancelled,
            refunded = summary.refunded,
            errors = summary.errors,
            "Event cancellation finished"
        );
        Ok(summary)
    }
}

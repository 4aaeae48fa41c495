//! Shared confirmation path for every reconciler
//!
//! Webhooks, the polling tiers, the stale sweep and proactive confirmation
//! all end up here once a provider reports a payment as completed.

use std::sync::Arc;

use eventpass_shared::{ConditionalUpdate, TicketRecord, TicketStatus};
use time::OffsetDateTime;

use crate::email::TicketNotifier;
use crate::error::BillingResult;
use crate::providers::{PaymentGateways, SessionStatus};
use crate::store::TicketStore;

/// Which reconciler observed the payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmationSource {
    Webhook,
    FastPoll,
    RegularPoll,
    GracePoll,
    StaleSweep,
    Proactive,
    RetryCheckout,
}

impl ConfirmationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationSource::Webhook => "webhook",
            ConfirmationSource::FastPoll => "fast_poll",
            ConfirmationSource::RegularPoll => "regular_poll",
            ConfirmationSource::GracePoll => "grace_poll",
            ConfirmationSource::StaleSweep => "stale_sweep",
            ConfirmationSource::Proactive => "proactive",
            ConfirmationSource::RetryCheckout => "retry_checkout",
        }
    }
}

impl std::fmt::Display for ConfirmationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of recording a completed payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// This call moved the ticket to `paid`
    Confirmed,
    /// Another reconciler got there first
    AlreadyConfirmed,
    /// Money arrived for a ticket that was cancelled before it was ever paid
    PaidAfterCancellation,
    TicketMissing,
}

/// Result of asking the provider about one ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Paid(ConfirmOutcome),
    NotCompleted,
    Failed { reason: String },
    /// Checkout was never created for this ticket
    NoSession,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn TicketStore>,
    gateways: PaymentGateways,
    notifier: Arc<dyn TicketNotifier>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn TicketStore>,
        gateways: PaymentGateways,
        notifier: Arc<dyn TicketNotifier>,
    ) -> Self {
        Self {
            store,
            gateways,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    pub fn gateways(&self) -> &PaymentGateways {
        &self.gateways
    }

    pub fn notifier(&self) -> &Arc<dyn TicketNotifier> {
        &self.notifier
    }

    /// Move a ticket to `paid`; only the winner sends the confirmation e-mail
    pub async fn apply_confirmation(
        &self,
        ticket: &TicketRecord,
        payment_ref: &str,
        source: ConfirmationSource,
        now: OffsetDateTime,
    ) -> BillingResult<ConfirmOutcome> {
        let update = ConditionalUpdate::confirm_payment(ticket.id, payment_ref, now);

        if self.store.apply(&update).await? {
            let reactivated = ticket.status == TicketStatus::PendingCancellation;
            tracing::info!(
                ticket_id = %ticket.id,
                provider = %ticket.payment_provider,
                payment_ref = %payment_ref,
                source = %source,
                reactivated = reactivated,
                "Ticket confirmed as paid"
            );

            let confirmed = match self.store.get_ticket(ticket.id).await? {
                Some(current) => current,
                None => {
                    let mut local = ticket.clone();
                    update.apply_to(&mut local);
                    local
                }
            };

            if let Err(e) = self.notifier.send_payment_confirmation(&confirmed).await {
                tracing::error!(
                    ticket_id = %ticket.id,
                    error = %e,
                    "Failed to send payment confirmation email"
                );
            }
            return Ok(ConfirmOutcome::Confirmed);
        }

        let Some(current) = self.store.get_ticket(ticket.id).await? else {
            tracing::warn!(ticket_id = %ticket.id, source = %source, "Ticket vanished during confirmation");
            return Ok(ConfirmOutcome::TicketMissing);
        };

        match current.status {
            TicketStatus::Cancelled if current.provider_payment_ref.is_none() => {
                tracing::error!(
                    ticket_id = %ticket.id,
                    provider = %ticket.payment_provider,
                    payment_ref = %payment_ref,
                    source = %source,
                    "Payment completed for a cancelled ticket, manual refund required"
                );
                Ok(ConfirmOutcome::PaidAfterCancellation)
            }
            status => {
                tracing::debug!(
                    ticket_id = %ticket.id,
                    status = %status,
                    source = %source,
                    "Confirmation already applied"
                );
                Ok(ConfirmOutcome::AlreadyConfirmed)
            }
        }
    }

    /// Ask the provider about a ticket's checkout and confirm it if paid
    ///
    /// With `finalize` set, buyer-approved payments are captured first;
    /// otherwise the provider is only read.
    pub async fn check_ticket(
        &self,
        ticket: &TicketRecord,
        source: ConfirmationSource,
        finalize: bool,
        now: OffsetDateTime,
    ) -> BillingResult<CheckOutcome> {
        let Some(session_id) = ticket.provider_session_id.as_deref() else {
            return Ok(CheckOutcome::NoSession);
        };

        let provider = ticket.payment_provider;
        let status = if finalize {
            self.gateways.finalize_approved(provider, session_id).await?
        } else {
            self.gateways.session_status(provider, session_id).await?
        };

        match status {
            SessionStatus::Completed { payment_ref } => {
                let outcome = self
                    .apply_confirmation(ticket, &payment_ref, source, now)
                    .await?;
                Ok(CheckOutcome::Paid(outcome))
            }
            SessionStatus::NotCompleted => Ok(CheckOutcome::NotCompleted),
            SessionStatus::Failed { reason } => {
                tracing::info!(
                    ticket_id = %ticket.id,
                    provider = %provider,
                    reason = %reason,
                    source = %source,
                    "Provider reports payment failed"
                );
                Ok(CheckOutcome::Failed { reason })
            }
        }
    }
}

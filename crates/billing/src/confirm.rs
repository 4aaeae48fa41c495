//! Confirmation triggered by the buyer returning from checkout

use std::sync::Arc;

use eventpass_shared::TicketStatus;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::actor::Actor;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{CheckOutcome, ConfirmOutcome, ConfirmationSource, Reconciler};
use crate::store::TicketStore;

/// Correlation tokens from the provider's return redirect
///
/// Advisory only; the stored session is what gets checked.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmationHints {
    /// Stripe `session_id` or PayPal `token`
    #[serde(default, alias = "token")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Paid,
    /// Not paid yet; the caller may ask again
    Pending,
    /// Ticket is cancelled or refunded; nothing was changed
    Final { ticket_status: TicketStatus },
}

pub struct ProactiveConfirmation {
    store: Arc<dyn TicketStore>,
    reconciler: Reconciler,
}

impl ProactiveConfirmation {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            store: reconciler.store().clone(),
            reconciler,
        }
    }

    pub async fn confirm(
        &self,
        ticket_id: Uuid,
        actor: Actor,
        hints: ConfirmationHints,
        now: OffsetDateTime,
    ) -> BillingResult<ConfirmationStatus> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or(BillingError::TicketNotFound(ticket_id))?;
        actor.authorize(&ticket)?;

        match ticket.status {
            TicketStatus::Paid => return Ok(ConfirmationStatus::Paid),
            TicketStatus::Cancelled | TicketStatus::Refunded => {
                return Ok(ConfirmationStatus::Final {
                    ticket_status: ticket.status,
                })
            }
            TicketStatus::Pending | TicketStatus::PendingCancellation => {}
        }

        if let Some(hint) = hints.session_id.as_deref() {
            if ticket.provider_session_id.as_deref() != Some(hint) {
                tracing::warn!(
                    ticket_id = %ticket.id,
                    provider = %ticket.payment_provider,
                    hinted_session = %hint,
                    stored_session = ?ticket.provider_session_id,
                    "Return token does not match stored session, using stored session"
                );
            }
        }

        let outcome = self
            .reconciler
            .check_ticket(&ticket, ConfirmationSource::Proactive, true, now)
            .await?;

        match outcome {
            CheckOutcome::Paid(ConfirmOutcome::PaidAfterCancellation) => {
                Ok(ConfirmationStatus::Final {
                    ticket_status: TicketStatus::Cancelled,
                })
            }
            CheckOutcome::Paid(ConfirmOutcome::TicketMissing) => {
                Err(BillingError::TicketNotFound(ticket_id))
            }
            CheckOutcome::Paid(_) => Ok(ConfirmationStatus::Paid),
            CheckOutcome::NotCompleted | CheckOutcome::Failed { .. } | CheckOutcome::NoSession => {
                // A lost race can leave the ticket final in the meantime
                match self.store.get_ticket(ticket_id).await? {
                    Some(current) if current.status.is_final() => Ok(ConfirmationStatus::Final {
                        ticket_status: current.status,
                    }),
                    Some(current) if current.status == TicketStatus::Paid => {
                        Ok(ConfirmationStatus::Paid)
                    }
                    _ => Ok(ConfirmationStatus::Pending),
                }
            }
        }
    }
}

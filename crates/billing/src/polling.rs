//! Periodic reconciliation against the providers
//!
//! Three polling tiers re-check tickets whose checkout may have completed
//! without a webhook reaching us. Two sweeps retire tickets: abandoned
//! checkouts and grace periods that ran out. Every selection is derived from
//! persisted timestamps, so overlapping runs and restarts are harmless.

use std::sync::Arc;

use eventpass_shared::{ConditionalUpdate, TicketRecord, TicketStatus};
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::ReconcileConfig;
use crate::error::BillingResult;
use crate::reconcile::{CheckOutcome, ConfirmOutcome, ConfirmationSource, Reconciler};
use crate::store::{TicketQuery, TicketStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollTier {
    /// Pending tickets created in the last few seconds
    Fast,
    /// Pending tickets older than the fast window
    Regular,
    /// Tickets inside their cancellation grace window
    Grace,
}

impl PollTier {
    pub const ALL: [PollTier; 3] = [PollTier::Fast, PollTier::Regular, PollTier::Grace];

    pub fn as_str(&self) -> &'static str {
        match self {
            PollTier::Fast => "fast",
            PollTier::Regular => "regular",
            PollTier::Grace => "grace",
        }
    }

    fn source(&self) -> ConfirmationSource {
        match self {
            PollTier::Fast => ConfirmationSource::FastPoll,
            PollTier::Regular => ConfirmationSource::RegularPoll,
            PollTier::Grace => ConfirmationSource::GracePoll,
        }
    }

    /// Tickets this tier looks at, as of `now`
    pub fn query(&self, config: &ReconcileConfig, now: OffsetDateTime) -> TicketQuery {
        match self {
            PollTier::Fast => TicketQuery::with_status(TicketStatus::Pending, config.poll_batch_size)
                .created_between(now - config.fast_poll_window, now),
            PollTier::Regular => {
                TicketQuery::with_status(TicketStatus::Pending, config.poll_batch_size)
                    .created_between(now - config.regular_poll_window, now - config.fast_poll_window)
            }
            PollTier::Grace => {
                TicketQuery::with_status(TicketStatus::PendingCancellation, config.poll_batch_size)
                    .updated_after(now - config.grace_window)
            }
        }
    }
}

impl std::fmt::Display for PollTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub checked: usize,
    pub confirmed: usize,
    pub still_pending: usize,
    pub failed: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub examined: usize,
    pub cancelled: usize,
    /// Stale tickets that turned out to be paid
    pub confirmed: usize,
    /// Lost a race or deferred to the next cycle
    pub skipped: usize,
    pub errors: usize,
}

pub struct PollingReconciler {
    store: Arc<dyn TicketStore>,
    reconciler: Reconciler,
    config: ReconcileConfig,
}

impl PollingReconciler {
    pub fn new(reconciler: Reconciler, config: ReconcileConfig) -> Self {
        Self {
            store: reconciler.store().clone(),
            reconciler,
            config,
        }
    }

    /// One pass of a polling tier; provider calls are read-only
    pub async fn run_tier(&self, tier: PollTier, now: OffsetDateTime) -> BillingResult<PollSummary> {
        let tickets = self.store.list_tickets(&tier.query(&self.config, now)).await?;
        let mut summary = PollSummary::default();

        for ticket in &tickets {
            summary.checked += 1;
            match self
                .reconciler
                .check_ticket(ticket, tier.source(), false, now)
                .await
            {
                Ok(CheckOutcome::Paid(ConfirmOutcome::Confirmed)) => summary.confirmed += 1,
                Ok(CheckOutcome::Paid(_)) => {}
                Ok(CheckOutcome::NotCompleted | CheckOutcome::NoSession) => {
                    summary.still_pending += 1
                }
                Ok(CheckOutcome::Failed { .. }) => summary.failed += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(
                        ticket_id = %ticket.id,
                        provider = %ticket.payment_provider,
                        tier = %tier,
                        error = %e,
                        "Status check failed, retrying next cycle"
                    );
                }
            }
        }

        if summary.checked > 0 {
            tracing::debug!(
                tier = %tier,
                checked = summary.checked,
                confirmed = summary.confirmed,
                errors = summary.errors,
                "Polling tier finished"
            );
        }
        Ok(summary)
    }

    /// Cancel pending tickets whose checkout was abandoned
    ///
    /// Before cancelling, the provider gets one last chance to report (or
    /// capture) a payment.
    pub async fn sweep_stale_pending(&self, now: OffsetDateTime) -> BillingResult<SweepSummary> {
        let cutoff = now - self.config.stale_pending_after;
        let query = TicketQuery::with_status(TicketStatus::Pending, self.config.poll_batch_size)
            .updated_not_after(cutoff);
        let tickets = self.store.list_tickets(&query).await?;
        let mut summary = SweepSummary::default();

        for ticket in &tickets {
            summary.examined += 1;

            match self
                .reconciler
                .check_ticket(ticket, ConfirmationSource::StaleSweep, true, now)
                .await
            {
                Ok(CheckOutcome::Paid(ConfirmOutcome::Confirmed)) => {
                    summary.confirmed += 1;
                    continue;
                }
                Ok(CheckOutcome::Paid(_)) => {
                    summary.skipped += 1;
                    continue;
                }
                Ok(CheckOutcome::NotCompleted | CheckOutcome::Failed { .. } | CheckOutcome::NoSession) => {}
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(
                        ticket_id = %ticket.id,
                        provider = %ticket.payment_provider,
                        error = %e,
                        "Last status check failed, deferring stale ticket"
                    );
                    // Let the rest of the backlog into the next batch
                    if let Err(e) = self
                        .store
                        .defer_ticket(ticket.id, TicketStatus::Pending, ticket.updated_at, now)
                        .await
                    {
                        tracing::error!(ticket_id = %ticket.id, error = %e, "Failed to defer stale ticket");
                    }
                    continue;
                }
            }

            match self.abandon(ticket, now).await {
                Ok(true) => summary.cancelled += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(ticket_id = %ticket.id, error = %e, "Failed to cancel stale ticket");
                }
            }
        }

        if summary.examined > 0 {
            tracing::info!(
                examined = summary.examined,
                cancelled = summary.cancelled,
                confirmed = summary.confirmed,
                errors = summary.errors,
                "Stale pending sweep finished"
            );
        }
        Ok(summary)
    }

    async fn abandon(&self, ticket: &TicketRecord, now: OffsetDateTime) -> BillingResult<bool> {
        let update =
            ConditionalUpdate::abandon_unpaid(ticket.id, now).untouched_since(ticket.updated_at);
        let won = self.store.apply(&update).await?;
        if won {
            tracing::info!(
                ticket_id = %ticket.id,
                event_id = %ticket.event_id,
                created_at = %ticket.created_at,
                "Cancelled abandoned checkout"
            );
        }
        Ok(won)
    }

    /// Cancel tickets whose grace window ran out
    ///
    /// No provider call: a payment that completes later is caught by the
    /// confirmation path and logged for manual refund.
    pub async fn finalize_grace_periods(&self, now: OffsetDateTime) -> BillingResult<SweepSummary> {
        let cutoff = now - self.config.grace_window;
        let query =
            TicketQuery::with_status(TicketStatus::PendingCancellation, self.config.poll_batch_size)
                .updated_not_after(cutoff);
        let tickets = self.store.list_tickets(&query).await?;
        let mut summary = SweepSummary::default();

        for ticket in &tickets {
            summary.examined += 1;
            let update =
                ConditionalUpdate::expire_grace(ticket.id, now).untouched_since(ticket.updated_at);

            match self.store.apply(&update).await {
                Ok(true) => {
                    summary.cancelled += 1;
                    tracing::info!(ticket_id = %ticket.id, "Grace period expired, ticket cancelled");

                    let mut cancelled = ticket.clone();
                    update.apply_to(&mut cancelled);
                    if let Err(e) = self
                        .reconciler
                        .notifier()
                        .send_cancellation_notice(&cancelled)
                        .await
                    {
                        tracing::error!(
                            ticket_id = %ticket.id,
                            error = %e,
                            "Failed to send cancellation notice"
                        );
                    }
                }
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(ticket_id = %ticket.id, error = %e, "Failed to expire grace period");
                }
            }
        }

        Ok(summary)
    }
}

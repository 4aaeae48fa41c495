//! Provider webhook handling
//!
//! Verified events are claimed by provider event id before processing so a
//! redelivered event is acknowledged without touching tickets again. Any
//! event that passed verification is acknowledged even if processing failed;
//! the polling tiers pick the ticket up on their next pass.

use std::sync::Arc;

use eventpass_shared::{PaymentProvider, TicketRecord};
use reqwest::header::HeaderMap;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::providers::{ProviderEvent, ProviderEventKind, SessionStatus};
use crate::reconcile::{ConfirmationSource, Reconciler};
use crate::store::{TicketStore, WebhookClaim};

/// How an accepted webhook was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAck {
    Processed,
    Duplicate,
    NoMatchingTicket,
    Ignored,
    /// Accepted, but processing failed; polling will reconcile
    ProcessingFailed,
}

pub struct WebhookHandler {
    store: Arc<dyn TicketStore>,
    reconciler: Reconciler,
}

impl WebhookHandler {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            store: reconciler.store().clone(),
            reconciler,
        }
    }

    /// Verify, deduplicate and apply one webhook delivery
    ///
    /// Errors are only returned when the delivery itself is unacceptable
    /// (bad signature, malformed payload) or could not be verified because the
    /// provider was unreachable.
    pub async fn handle(
        &self,
        provider: PaymentProvider,
        headers: &HeaderMap,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookAck> {
        let event = self
            .reconciler
            .gateways()
            .verify_webhook(provider, headers, payload)
            .await
            .map_err(|e| {
                tracing::warn!(provider = %provider, error = %e, "Rejected webhook");
                e
            })?;

        let claim = self
            .store
            .claim_webhook_event(provider, &event.event_id, &event.event_type, now)
            .await;

        match claim {
            Ok(WebhookClaim::Claimed) => {}
            Ok(WebhookClaim::Duplicate { processing_result }) => {
                tracing::info!(
                    provider = %provider,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    processing_result = %processing_result,
                    "Duplicate webhook event"
                );
                return Ok(WebhookAck::Duplicate);
            }
            Err(e) => {
                tracing::error!(
                    provider = %provider,
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to claim webhook event"
                );
                return Ok(WebhookAck::ProcessingFailed);
            }
        }

        tracing::info!(
            provider = %provider,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.process(provider, &event, now).await;
        let error_message = result.as_ref().err().map(|e| e.to_string());

        // Retry once; a row left in processing blocks redelivery for 30 minutes
        if let Err(e) = self
            .store
            .complete_webhook_event(provider, &event.event_id, error_message.as_deref())
            .await
        {
            tracing::warn!(
                event_id = %event.event_id,
                error = %e,
                "First attempt to record webhook result failed, retrying"
            );
            if let Err(retry_err) = self
                .store
                .complete_webhook_event(provider, &event.event_id, error_message.as_deref())
                .await
            {
                tracing::error!(
                    provider = %provider,
                    event_id = %event.event_id,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record webhook result after retry"
                );
            }
        }

        match result {
            Ok(ack) => Ok(ack),
            Err(e) => {
                tracing::error!(
                    provider = %provider,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed, leaving ticket to polling"
                );
                Ok(WebhookAck::ProcessingFailed)
            }
        }
    }

    async fn ticket_for(
        &self,
        provider: PaymentProvider,
        event: &ProviderEvent,
        session_id: &str,
    ) -> BillingResult<Option<TicketRecord>> {
        let ticket = self.store.find_by_session(provider, session_id).await?;
        if ticket.is_none() {
            tracing::warn!(
                provider = %provider,
                event_id = %event.event_id,
                session_id = %session_id,
                "No ticket for webhook session"
            );
        }
        Ok(ticket)
    }

    async fn process(
        &self,
        provider: PaymentProvider,
        event: &ProviderEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookAck> {
        match &event.kind {
            ProviderEventKind::Ignored => {
                tracing::debug!(
                    provider = %provider,
                    event_type = %event.event_type,
                    "Ignoring webhook event"
                );
                Ok(WebhookAck::Ignored)
            }
            ProviderEventKind::PaymentCompleted {
                session_id,
                payment_ref,
            } => {
                let Some(ticket) = self.ticket_for(provider, event, session_id).await? else {
                    return Ok(WebhookAck::NoMatchingTicket);
                };
                self.reconciler
                    .apply_confirmation(&ticket, payment_ref, ConfirmationSource::Webhook, now)
                    .await?;
                Ok(WebhookAck::Processed)
            }
            ProviderEventKind::CheckoutApproved { session_id } => {
                let Some(ticket) = self.ticket_for(provider, event, session_id).await? else {
                    return Ok(WebhookAck::NoMatchingTicket);
                };
                // Never capture for a closed ticket; the uncaptured order lapses
                if ticket.status.is_final() {
                    tracing::info!(
                        provider = %provider,
                        event_id = %event.event_id,
                        ticket_id = %ticket.id,
                        ticket_status = %ticket.status,
                        "Skipping capture of approved order for closed ticket"
                    );
                    return Ok(WebhookAck::Processed);
                }
                let status = self
                    .reconciler
                    .gateways()
                    .finalize_approved(provider, session_id)
                    .await?;
                if let SessionStatus::Completed { payment_ref } = status {
                    self.reconciler
                        .apply_confirmation(&ticket, &payment_ref, ConfirmationSource::Webhook, now)
                        .await?;
                }
                Ok(WebhookAck::Processed)
            }
            ProviderEventKind::PaymentFailed { session_id, reason } => {
                // Failure is informational; the ticket stays pending until it
                // is paid, cancelled or swept as stale
                tracing::info!(
                    provider = %provider,
                    event_id = %event.event_id,
                    session_id = ?session_id,
                    reason = %reason,
                    "Provider reported failed payment"
                );
                Ok(WebhookAck::Processed)
            }
        }
    }
}

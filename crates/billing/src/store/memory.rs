//! In-memory ticket store for local runs and tests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eventpass_shared::{
    ConditionalUpdate, EventInfo, NewTicket, PaymentProvider, TicketRecord, TicketStatus,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{TicketQuery, TicketStore, WebhookClaim, WEBHOOK_PROCESSING_TIMEOUT};
use crate::error::{BillingError, BillingResult};

#[derive(Debug)]
struct WebhookRecord {
    processing_result: String,
    started_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    tickets: HashMap<Uuid, TicketRecord>,
    events: HashMap<Uuid, EventInfo>,
    webhook_events: HashMap<(PaymentProvider, String), WebhookRecord>,
}

/// Store backed by a single mutex; every operation is atomic
#[derive(Debug, Clone, Default)]
pub struct InMemoryTicketStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, event: EventInfo) {
        self.state.lock().await.events.insert(event.id, event);
    }

    /// Seed or overwrite a ticket as-is
    pub async fn put_ticket(&self, ticket: TicketRecord) {
        self.state.lock().await.tickets.insert(ticket.id, ticket);
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn get_ticket(&self, ticket_id: Uuid) -> BillingResult<Option<TicketRecord>> {
        Ok(self.state.lock().await.tickets.get(&ticket_id).cloned())
    }

    async fn find_by_session(
        &self,
        provider: PaymentProvider,
        session_id: &str,
    ) -> BillingResult<Option<TicketRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .tickets
            .values()
            .find(|t| {
                t.payment_provider == provider
                    && t.provider_session_id.as_deref() == Some(session_id)
            })
            .cloned())
    }

    async fn list_tickets(&self, query: &TicketQuery) -> BillingResult<Vec<TicketRecord>> {
        let state = self.state.lock().await;
        let mut tickets: Vec<TicketRecord> = state
            .tickets
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        // Least recently touched first, like the Postgres store
        tickets.sort_by_key(|t| (t.updated_at, t.created_at));
        tickets.truncate(usize::try_from(query.limit.max(0)).unwrap_or(usize::MAX));
        Ok(tickets)
    }

    async fn list_event_tickets(
        &self,
        event_id: Uuid,
        statuses: &[TicketStatus],
    ) -> BillingResult<Vec<TicketRecord>> {
        let state = self.state.lock().await;
        let mut tickets: Vec<TicketRecord> = state
            .tickets
            .values()
            .filter(|t| t.event_id == event_id && statuses.contains(&t.status))
            .cloned()
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }

    async fn get_event(&self, event_id: Uuid) -> BillingResult<Option<EventInfo>> {
        Ok(self.state.lock().await.events.get(&event_id).cloned())
    }

    async fn count_reserved(&self, event_id: Uuid) -> BillingResult<i64> {
        let state = self.state.lock().await;
        let count = state
            .tickets
            .values()
            .filter(|t| t.event_id == event_id && t.status.holds_capacity())
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn insert_with_capacity(&self, ticket: NewTicket) -> BillingResult<TicketRecord> {
        let mut state = self.state.lock().await;

        let max_participants = state
            .events
            .get(&ticket.event_id)
            .map(|e| e.max_participants)
            .ok_or(BillingError::EventNotFound(ticket.event_id))?;

        let reserved = state
            .tickets
            .values()
            .filter(|t| t.event_id == ticket.event_id && t.status.holds_capacity())
            .count();

        if i64::try_from(reserved).unwrap_or(i64::MAX) >= max_participants {
            return Err(BillingError::CapacityExceeded);
        }

        let record = ticket.into_record();
        state.tickets.insert(record.id, record.clone());
        Ok(record)
    }

    async fn set_checkout_session(
        &self,
        ticket_id: Uuid,
        session_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.tickets.get_mut(&ticket_id) {
            Some(ticket) if ticket.status == TicketStatus::Pending => {
                ticket.provider_session_id = Some(session_id.to_string());
                ticket.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn defer_ticket(
        &self,
        ticket_id: Uuid,
        status: TicketStatus,
        seen_updated_at: OffsetDateTime,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.tickets.get_mut(&ticket_id) {
            Some(ticket) if ticket.status == status && ticket.updated_at == seen_updated_at => {
                ticket.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply(&self, update: &ConditionalUpdate) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .tickets
            .get_mut(&update.ticket_id)
            .is_some_and(|ticket| update.apply_to(ticket)))
    }

    async fn claim_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        _event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        let mut state = self.state.lock().await;
        let key = (provider, event_id.to_string());

        if let Some(existing) = state.webhook_events.get(&key) {
            let stuck = existing.processing_result == "processing"
                && existing.started_at < now - WEBHOOK_PROCESSING_TIMEOUT;
            if existing.processing_result != "error" && !stuck {
                return Ok(WebhookClaim::Duplicate {
                    processing_result: existing.processing_result.clone(),
                });
            }
        }

        state.webhook_events.insert(
            key,
            WebhookRecord {
                processing_result: "processing".to_string(),
                started_at: now,
            },
        );
        Ok(WebhookClaim::Claimed)
    }

    async fn complete_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .webhook_events
            .get_mut(&(provider, event_id.to_string()))
        {
            record.processing_result = match error_message {
                Some(_) => "error".to_string(),
                None => "success".to_string(),
            };
        }
        Ok(())
    }
}

//! Ticket persistence
//!
//! The store is the only coordination point between reconcilers. Every status
//! change goes through [`TicketStore::apply`], which must evaluate the
//! [`ConditionalUpdate`] atomically against the current row.

mod memory;
mod postgres;

pub use memory::InMemoryTicketStore;
pub use postgres::PgTicketStore;

use async_trait::async_trait;
use eventpass_shared::{
    ConditionalUpdate, EventInfo, NewTicket, PaymentProvider, TicketRecord, TicketStatus,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// Webhook deliveries stuck in `processing` longer than this may be reclaimed
pub const WEBHOOK_PROCESSING_TIMEOUT: Duration = Duration::minutes(30);

/// Selection criteria for the polling loops and sweeps
///
/// Lower bounds are exclusive, upper bounds inclusive. Results are ordered
/// oldest first and capped at `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketQuery {
    pub status: TicketStatus,
    pub created_after: Option<OffsetDateTime>,
    pub created_not_after: Option<OffsetDateTime>,
    pub updated_after: Option<OffsetDateTime>,
    pub updated_not_after: Option<OffsetDateTime>,
    pub limit: i64,
}

impl TicketQuery {
    pub fn with_status(status: TicketStatus, limit: i64) -> Self {
        Self {
            status,
            created_after: None,
            created_not_after: None,
            updated_after: None,
            updated_not_after: None,
            limit,
        }
    }

    pub fn created_between(mut self, after: OffsetDateTime, not_after: OffsetDateTime) -> Self {
        self.created_after = Some(after);
        self.created_not_after = Some(not_after);
        self
    }

    pub fn updated_after(mut self, after: OffsetDateTime) -> Self {
        self.updated_after = Some(after);
        self
    }

    pub fn updated_not_after(mut self, not_after: OffsetDateTime) -> Self {
        self.updated_not_after = Some(not_after);
        self
    }

    pub fn matches(&self, ticket: &TicketRecord) -> bool {
        ticket.status == self.status
            && self.created_after.map_or(true, |t| ticket.created_at > t)
            && self.created_not_after.map_or(true, |t| ticket.created_at <= t)
            && self.updated_after.map_or(true, |t| ticket.updated_at > t)
            && self.updated_not_after.map_or(true, |t| ticket.updated_at <= t)
    }
}

/// Result of trying to take ownership of an inbound webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookClaim {
    /// This caller processes the event
    Claimed,
    /// Already processed or being processed elsewhere
    Duplicate { processing_result: String },
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn get_ticket(&self, ticket_id: Uuid) -> BillingResult<Option<TicketRecord>>;

    /// Map a provider checkout session/order back to its ticket
    async fn find_by_session(
        &self,
        provider: PaymentProvider,
        session_id: &str,
    ) -> BillingResult<Option<TicketRecord>>;

    async fn list_tickets(&self, query: &TicketQuery) -> BillingResult<Vec<TicketRecord>>;

    async fn list_event_tickets(
        &self,
        event_id: Uuid,
        statuses: &[TicketStatus],
    ) -> BillingResult<Vec<TicketRecord>>;

    async fn get_event(&self, event_id: Uuid) -> BillingResult<Option<EventInfo>>;

    /// Tickets currently holding a seat of the event
    async fn count_reserved(&self, event_id: Uuid) -> BillingResult<i64>;

    /// Insert a pending ticket if the event still has a free seat
    ///
    /// The capacity check and the insert are one atomic step. Fails with
    /// `CapacityExceeded` when the event is full.
    async fn insert_with_capacity(&self, ticket: NewTicket) -> BillingResult<TicketRecord>;

    /// Attach a checkout session to a ticket that is still pending
    async fn set_checkout_session(
        &self,
        ticket_id: Uuid,
        session_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Apply a conditional status change, returning whether it took effect
    async fn apply(&self, update: &ConditionalUpdate) -> BillingResult<bool>;

    /// Move a ticket to the back of timestamp-ordered batches
    ///
    /// Only bumps `updated_at` when the ticket still has `status` and has not
    /// been written since `seen_updated_at`.
    async fn defer_ticket(
        &self,
        ticket_id: Uuid,
        status: TicketStatus,
        seen_updated_at: OffsetDateTime,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn claim_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookClaim>;

    async fn complete_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}

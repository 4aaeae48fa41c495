//! PostgreSQL ticket store

use async_trait::async_trait;
use eventpass_shared::{
    ConditionalUpdate, EventInfo, NewTicket, PaymentProvider, TicketRecord, TicketStatus,
    Transition,
};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{TicketQuery, TicketStore, WebhookClaim, WEBHOOK_PROCESSING_TIMEOUT};
use crate::error::{BillingError, BillingResult};

const TICKET_COLUMNS: &str = "id, user_id, event_id, status, price_cents, pickup_fee_cents, \
    pickup_selected, total_amount_cents, payment_provider, provider_session_id, \
    provider_payment_ref, refunded_amount_cents, refunded_at, cancelled_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    user_id: Uuid,
    event_id: Uuid,
    status: String,
    price_cents: i64,
    pickup_fee_cents: i64,
    pickup_selected: bool,
    total_amount_cents: i64,
    payment_provider: String,
    provider_session_id: Option<String>,
    provider_payment_ref: Option<String>,
    refunded_amount_cents: i64,
    refunded_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TicketRow> for TicketRecord {
    type Error = BillingError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(TicketRecord {
            id: row.id,
            user_id: row.user_id,
            event_id: row.event_id,
            status: row.status.parse()?,
            price_cents: row.price_cents,
            pickup_fee_cents: row.pickup_fee_cents,
            pickup_selected: row.pickup_selected,
            total_amount_cents: row.total_amount_cents,
            payment_provider: row.payment_provider.parse()?,
            provider_session_id: row.provider_session_id,
            provider_payment_ref: row.provider_payment_ref,
            refunded_amount_cents: row.refunded_amount_cents,
            refunded_at: row.refunded_at,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    title: String,
    starts_at: OffsetDateTime,
    max_participants: i64,
    price_cents: i64,
    pickup_fee_cents: i64,
    currency: String,
    is_active: bool,
}

impl From<EventRow> for EventInfo {
    fn from(row: EventRow) -> Self {
        EventInfo {
            id: row.id,
            title: row.title,
            starts_at: row.starts_at,
            max_participants: row.max_participants,
            price_cents: row.price_cents,
            pickup_fee_cents: row.pickup_fee_cents,
            currency: row.currency,
            is_active: row.is_active,
        }
    }
}

fn status_names(statuses: &[TicketStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn into_records(rows: Vec<TicketRow>) -> BillingResult<Vec<TicketRecord>> {
    rows.into_iter().map(TicketRecord::try_from).collect()
}

/// Extra column assignments that accompany each transition
fn set_clause(transition: Transition) -> &'static str {
    match transition {
        Transition::ConfirmPayment => {
            ", provider_payment_ref = COALESCE(provider_payment_ref, $5)"
        }
        Transition::RequestCancellation => "",
        Transition::AbandonUnpaid | Transition::ExpireGrace | Transition::CancelPaid => {
            ", refunded_amount_cents = 0, cancelled_at = COALESCE(cancelled_at, $2)"
        }
        Transition::RefundPaid => {
            ", refunded_amount_cents = $5, refunded_at = COALESCE(refunded_at, $2)"
        }
    }
}

#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn get_ticket(&self, ticket_id: Uuid) -> BillingResult<Option<TicketRecord>> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1");
        let row: Option<TicketRow> = sqlx::query_as(&sql)
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TicketRecord::try_from).transpose()
    }

    async fn find_by_session(
        &self,
        provider: PaymentProvider,
        session_id: &str,
    ) -> BillingResult<Option<TicketRecord>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE payment_provider = $1 AND provider_session_id = $2"
        );
        let row: Option<TicketRow> = sqlx::query_as(&sql)
            .bind(provider.as_str())
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TicketRecord::try_from).transpose()
    }

    async fn list_tickets(&self, query: &TicketQuery) -> BillingResult<Vec<TicketRecord>> {
        let sql = format!(
            r#"
            SELECT {TICKET_COLUMNS} FROM tickets
            WHERE status = $1
              AND ($2::timestamptz IS NULL OR created_at > $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
              AND ($4::timestamptz IS NULL OR updated_at > $4)
              AND ($5::timestamptz IS NULL OR updated_at <= $5)
            ORDER BY updated_at ASC, created_at ASC
            LIMIT $6
            "#
        );
        let rows: Vec<TicketRow> = sqlx::query_as(&sql)
            .bind(query.status.as_str())
            .bind(query.created_after)
            .bind(query.created_not_after)
            .bind(query.updated_after)
            .bind(query.updated_not_after)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    async fn list_event_tickets(
        &self,
        event_id: Uuid,
        statuses: &[TicketStatus],
    ) -> BillingResult<Vec<TicketRecord>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE event_id = $1 AND status = ANY($2) ORDER BY created_at ASC"
        );
        let rows: Vec<TicketRow> = sqlx::query_as(&sql)
            .bind(event_id)
            .bind(status_names(statuses))
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    async fn get_event(&self, event_id: Uuid) -> BillingResult<Option<EventInfo>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT id, title, starts_at, max_participants, price_cents,
                   pickup_fee_cents, currency, is_active
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EventInfo::from))
    }

    async fn count_reserved(&self, event_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tickets WHERE event_id = $1 AND status = ANY($2)",
        )
        .bind(event_id)
        .bind(status_names(&TicketStatus::RESERVING))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_with_capacity(&self, ticket: NewTicket) -> BillingResult<TicketRecord> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the event serializes concurrent bookings for it
        let max: Option<(i64,)> =
            sqlx::query_as("SELECT max_participants FROM events WHERE id = $1 FOR UPDATE")
                .bind(ticket.event_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (max_participants,) = max.ok_or(BillingError::EventNotFound(ticket.event_id))?;

        let (reserved,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tickets WHERE event_id = $1 AND status = ANY($2)",
        )
        .bind(ticket.event_id)
        .bind(status_names(&TicketStatus::RESERVING))
        .fetch_one(&mut *tx)
        .await?;

        if reserved >= max_participants {
            tracing::info!(
                event_id = %ticket.event_id,
                reserved = reserved,
                max_participants = max_participants,
                "Booking rejected, event is full"
            );
            return Err(BillingError::CapacityExceeded);
        }

        let sql = format!(
            r#"
            INSERT INTO tickets
                (id, user_id, event_id, status, price_cents, pickup_fee_cents,
                 pickup_selected, total_amount_cents, payment_provider,
                 refunded_amount_cents, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, 0, $9, $9)
            RETURNING {TICKET_COLUMNS}
            "#
        );
        let row: TicketRow = sqlx::query_as(&sql)
            .bind(ticket.id)
            .bind(ticket.user_id)
            .bind(ticket.event_id)
            .bind(ticket.price_cents)
            .bind(ticket.pickup_fee_cents)
            .bind(ticket.pickup_selected)
            .bind(ticket.total_amount_cents)
            .bind(ticket.payment_provider.as_str())
            .bind(ticket.created_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        TicketRecord::try_from(row)
    }

    async fn set_checkout_session(
        &self,
        ticket_id: Uuid,
        session_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tickets
            SET provider_session_id = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(ticket_id)
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn defer_ticket(
        &self,
        ticket_id: Uuid,
        status: TicketStatus,
        seen_updated_at: OffsetDateTime,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tickets
            SET updated_at = $4
            WHERE id = $1 AND status = $2 AND updated_at = $3
            "#,
        )
        .bind(ticket_id)
        .bind(status.as_str())
        .bind(seen_updated_at)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply(&self, update: &ConditionalUpdate) -> BillingResult<bool> {
        let sql = format!(
            r#"
            UPDATE tickets
            SET status = '{target}', updated_at = $2{assignments}
            WHERE id = $1
              AND status = ANY($3)
              AND ($4::timestamptz IS NULL OR updated_at <= $4)
            "#,
            target = update.target().as_str(),
            assignments = set_clause(update.transition),
        );

        let query = sqlx::query(&sql)
            .bind(update.ticket_id)
            .bind(update.at)
            .bind(status_names(update.transition.sources()))
            .bind(update.updated_not_after);

        let query = match update.transition {
            Transition::ConfirmPayment => query.bind(update.payment_ref.clone()),
            Transition::RefundPaid => query.bind(update.refunded_amount_cents),
            _ => query,
        };

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        // Failed deliveries and rows stuck in processing can be claimed again
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO provider_webhook_events
                (provider, provider_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', $4)
            ON CONFLICT (provider, provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $4,
                error_message = NULL
            WHERE provider_webhook_events.processing_result = 'error'
               OR (provider_webhook_events.processing_result = 'processing'
                   AND provider_webhook_events.processing_started_at < $5)
            RETURNING id
            "#,
        )
        .bind(provider.as_str())
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(now - WEBHOOK_PROCESSING_TIMEOUT)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(WebhookClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT processing_result FROM provider_webhook_events
            WHERE provider = $1 AND provider_event_id = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(WebhookClaim::Duplicate {
            processing_result: existing
                .map(|(result,)| result)
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn complete_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let processing_result = if error_message.is_some() {
            "error"
        } else {
            "success"
        };

        sqlx::query(
            r#"
            UPDATE provider_webhook_events
            SET processing_result = $3, error_message = $4
            WHERE provider = $1 AND provider_event_id = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(event_id)
        .bind(processing_result)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

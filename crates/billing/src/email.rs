//! Ticket e-mails
//!
//! Notifications are only sent by whichever reconciler wins the status
//! change, so every buyer gets each e-mail once. Failures are logged by the
//! caller and never undo the ticket transition.

use std::time::Duration;

use async_trait::async_trait;
use eventpass_shared::TicketRecord;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::EmailConfig;
use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Upper bound for one send, connection included
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait TicketNotifier: Send + Sync {
    async fn send_payment_confirmation(&self, ticket: &TicketRecord) -> BillingResult<()>;

    async fn send_cancellation_notice(&self, ticket: &TicketRecord) -> BillingResult<()>;
}

/// Recipient details resolved from the users and events tables
#[derive(Debug, sqlx::FromRow)]
struct Recipient {
    email: String,
    event_title: String,
    currency: String,
}

fn format_money(cents: i64, currency: &str) -> String {
    format!(
        "{}.{:02} {}",
        cents / 100,
        (cents % 100).abs(),
        currency.to_uppercase()
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn confirmation_message(ticket: &TicketRecord, event_title: &str, currency: &str) -> (String, String) {
    let subject = format!("Your ticket for {event_title}");
    let event_title = escape_html(event_title);
    let mut html = format!(
        "<p>Your payment of <strong>{}</strong> was received and your ticket for \
         <strong>{event_title}</strong> is confirmed.</p><p>Ticket reference: {}</p>",
        format_money(ticket.total_amount_cents, currency),
        ticket.id,
    );
    if ticket.pickup_selected {
        html.push_str("<p>You chose to pick up a physical ticket at the venue.</p>");
    }
    (subject, html)
}

fn cancellation_message(
    ticket: &TicketRecord,
    event_title: &str,
    currency: &str,
) -> (String, String) {
    let subject = format!("Your ticket for {event_title} was cancelled");
    let event_title = escape_html(event_title);
    let refund_line = if ticket.refunded_amount_cents > 0 {
        format!(
            "<p>A refund of <strong>{}</strong> is on its way to your original payment method.</p>",
            format_money(ticket.refunded_amount_cents, currency)
        )
    } else {
        "<p>No refund applies to this cancellation.</p>".to_string()
    };
    let html = format!(
        "<p>Your ticket for <strong>{event_title}</strong> (reference {}) has been cancelled.</p>{refund_line}",
        ticket.id,
    );
    (subject, html)
}

/// Sends ticket e-mails through Resend
///
/// Without `RESEND_API_KEY` messages are logged and dropped.
#[derive(Clone)]
pub struct TicketEmailService {
    http: reqwest::Client,
    pool: PgPool,
    config: EmailConfig,
}

impl TicketEmailService {
    pub fn new(pool: PgPool, config: EmailConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build email client: {e}")))?;
        Ok(Self { http, pool, config })
    }

    async fn recipient(&self, ticket: &TicketRecord) -> BillingResult<Option<Recipient>> {
        let recipient = sqlx::query_as::<_, Recipient>(
            r#"
            SELECT u.email, e.title AS event_title, e.currency
            FROM users u, events e
            WHERE u.id = $1 AND e.id = $2
            "#,
        )
        .bind(ticket.user_id)
        .bind(ticket.event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(recipient)
    }

    async fn send(&self, ticket_id: Uuid, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(api_key) = self.config.resend_api_key.as_deref() else {
            tracing::debug!(ticket_id = %ticket_id, subject = %subject, "Email disabled, skipping send");
            return Ok(());
        };

        let response = self
            .http
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(&json!({
                "from": self.config.from_address,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::InvalidRequest(format!(
                "resend returned {status}: {body}"
            )));
        }

        tracing::info!(ticket_id = %ticket_id, subject = %subject, "Sent ticket email");
        Ok(())
    }
}

#[async_trait]
impl TicketNotifier for TicketEmailService {
    async fn send_payment_confirmation(&self, ticket: &TicketRecord) -> BillingResult<()> {
        let Some(recipient) = self.recipient(ticket).await? else {
            tracing::warn!(ticket_id = %ticket.id, "No recipient for payment confirmation");
            return Ok(());
        };
        let (subject, html) =
            confirmation_message(ticket, &recipient.event_title, &recipient.currency);
        self.send(ticket.id, &recipient.email, &subject, &html).await
    }

    async fn send_cancellation_notice(&self, ticket: &TicketRecord) -> BillingResult<()> {
        let Some(recipient) = self.recipient(ticket).await? else {
            tracing::warn!(ticket_id = %ticket.id, "No recipient for cancellation notice");
            return Ok(());
        };
        let (subject, html) =
            cancellation_message(ticket, &recipient.event_title, &recipient.currency);
        self.send(ticket.id, &recipient.email, &subject, &html).await
    }
}

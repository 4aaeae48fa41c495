//! Audit trail for privileged ticket changes

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    /// An admin cancelled a single ticket
    AdminCancelTicket,
    /// A ticket was cancelled because its event was called off
    EventCancelTicket,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AdminCancelTicket => "admin_cancel_ticket",
            AuditAction::EventCancelTicket => "event_cancel_ticket",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn record(
        &self,
        action: AuditAction,
        actor_id: Uuid,
        ticket_id: Uuid,
        details: serde_json::Value,
    ) -> BillingResult<()>;
}

/// Writes audit entries to `ticket_audit_log`
#[derive(Clone)]
pub struct PgAuditLogger {
    pool: PgPool,
}

impl PgAuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLogger for PgAuditLogger {
    async fn record(
        &self,
        action: AuditAction,
        actor_id: Uuid,
        ticket_id: Uuid,
        details: serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ticket_audit_log (ticket_id, actor_id, action, details)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(ticket_id)
        .bind(actor_id)
        .bind(action.as_str())
        .bind(details)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            ticket_id = %ticket_id,
            actor_id = %actor_id,
            action = %action,
            "Recorded ticket audit entry"
        );
        Ok(())
    }
}

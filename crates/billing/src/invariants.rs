//! Ticket Invariants Module
//!
//! Read-only consistency checks over the tickets table. The worker runs them
//! daily; any violation points at a bug in a reconciler or a manual edit.
//!
//! ## Checks
//!
//! 1. **paid_has_payment_ref**: paid and refunded tickets carry a payment reference
//! 2. **refund_within_bounds**: refunded amount is consistent with status and total
//! 3. **timestamps_match_status**: `refunded_at`/`cancelled_at` agree with status
//! 4. **total_matches_components**: total equals price plus selected pickup fee
//! 5. **event_within_capacity**: reserved tickets never exceed capacity

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tickets affected (empty for event-level checks)
    pub ticket_ids: Vec<Uuid>,
    pub event_id: Option<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may have been taken or returned incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingPaymentRefRow {
    id: Uuid,
    event_id: Uuid,
    status: String,
    payment_provider: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RefundBoundsRow {
    id: Uuid,
    event_id: Uuid,
    status: String,
    total_amount_cents: i64,
    refunded_amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TimestampMismatchRow {
    id: Uuid,
    event_id: Uuid,
    status: String,
    refunded_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct TotalMismatchRow {
    id: Uuid,
    event_id: Uuid,
    price_cents: i64,
    pickup_fee_cents: i64,
    pickup_selected: bool,
    total_amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OverCapacityRow {
    event_id: Uuid,
    title: String,
    max_participants: i64,
    reserved: i64,
}

const CHECKS: [&str; 5] = [
    "paid_has_payment_ref",
    "refund_within_bounds",
    "timestamps_match_status",
    "total_matches_components",
    "event_within_capacity",
];

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS.len(),
            checks_passed: CHECKS.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name; unknown names find nothing
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "paid_has_payment_ref" => self.check_paid_has_payment_ref().await,
            "refund_within_bounds" => self.check_refund_within_bounds().await,
            "timestamps_match_status" => self.check_timestamps_match_status().await,
            "total_matches_components" => self.check_total_matches_components().await,
            "event_within_capacity" => self.check_event_within_capacity().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// A paid ticket without a payment reference cannot be refunded
    async fn check_paid_has_payment_ref(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingPaymentRefRow> = sqlx::query_as(
            r#"
            SELECT id, event_id, status, payment_provider
            FROM tickets
            WHERE status IN ('paid', 'refunded')
              AND provider_payment_ref IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_payment_ref".to_string(),
                ticket_ids: vec![row.id],
                event_id: Some(row.event_id),
                description: format!("Ticket is {} but has no payment reference", row.status),
                context: serde_json::json!({
                    "status": row.status,
                    "payment_provider": row.payment_provider,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_refund_within_bounds(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundBoundsRow> = sqlx::query_as(
            r#"
            SELECT id, event_id, status, total_amount_cents, refunded_amount_cents
            FROM tickets
            WHERE refunded_amount_cents < 0
               OR refunded_amount_cents > total_amount_cents
               OR (status = 'refunded' AND refunded_amount_cents = 0)
               OR (status <> 'refunded' AND refunded_amount_cents <> 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refund_within_bounds".to_string(),
                ticket_ids: vec![row.id],
                event_id: Some(row.event_id),
                description: format!(
                    "Ticket is {} with {} of {} cents refunded",
                    row.status, row.refunded_amount_cents, row.total_amount_cents
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "total_amount_cents": row.total_amount_cents,
                    "refunded_amount_cents": row.refunded_amount_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_timestamps_match_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TimestampMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, event_id, status, refunded_at, cancelled_at
            FROM tickets
            WHERE (status = 'refunded') <> (refunded_at IS NOT NULL)
               OR (status = 'cancelled' AND cancelled_at IS NULL)
               OR (status IN ('pending', 'paid', 'pending_cancellation') AND cancelled_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "timestamps_match_status".to_string(),
                ticket_ids: vec![row.id],
                event_id: Some(row.event_id),
                description: format!("Ticket is {} but its timestamps disagree", row.status),
                context: serde_json::json!({
                    "status": row.status,
                    "refunded_at": row.refunded_at,
                    "cancelled_at": row.cancelled_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_total_matches_components(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TotalMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, event_id, price_cents, pickup_fee_cents, pickup_selected, total_amount_cents
            FROM tickets
            WHERE total_amount_cents
                  <> price_cents + CASE WHEN pickup_selected THEN pickup_fee_cents ELSE 0 END
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "total_matches_components".to_string(),
                ticket_ids: vec![row.id],
                event_id: Some(row.event_id),
                description: format!(
                    "Ticket total {} does not match price {} plus pickup fee {}",
                    row.total_amount_cents, row.price_cents, row.pickup_fee_cents
                ),
                context: serde_json::json!({
                    "price_cents": row.price_cents,
                    "pickup_fee_cents": row.pickup_fee_cents,
                    "pickup_selected": row.pickup_selected,
                    "total_amount_cents": row.total_amount_cents,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Overbooking means the capacity lock was bypassed somewhere
    async fn check_event_within_capacity(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverCapacityRow> = sqlx::query_as(
            r#"
            SELECT e.id AS event_id, e.title, e.max_participants, COUNT(t.id) AS reserved
            FROM events e
            JOIN tickets t ON t.event_id = e.id
            WHERE t.status IN ('pending', 'paid', 'pending_cancellation')
            GROUP BY e.id, e.title, e.max_participants
            HAVING COUNT(t.id) > e.max_participants
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "event_within_capacity".to_string(),
                ticket_ids: vec![],
                event_id: Some(row.event_id),
                description: format!(
                    "Event '{}' holds {} tickets for {} places",
                    row.title, row.reserved, row.max_participants
                ),
                context: serde_json::json!({
                    "title": row.title,
                    "max_participants": row.max_participants,
                    "reserved": row.reserved,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }
}

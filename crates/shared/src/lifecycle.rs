//! Ticket lifecycle state machine
//!
//! Every status change is expressed as a [`ConditionalUpdate`]: "move to X
//! only if the current status is one of S". Stores apply it atomically and
//! report whether it took effect. An update that matches nothing means some
//! other actor already made the same move, which callers treat as success
//! without repeating side effects.
//!
//! ```text
//! pending              -> paid | pending_cancellation | cancelled
//! pending_cancellation -> paid | cancelled
//! paid                 -> cancelled | refunded
//! ```

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::ticket::{TicketRecord, TicketStatus};

/// Minimum distance between cancellation and event start for any refund
pub const REFUND_CUTOFF: Duration = Duration::days(7);

/// Named edges of the lifecycle graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Provider confirmed the payment (also reactivates a cancelling ticket)
    ConfirmPayment,
    /// User cancelled an unpaid ticket; the grace window starts
    RequestCancellation,
    /// Unpaid ticket dropped by an admin or the stale checkout sweep
    AbandonUnpaid,
    /// Grace window ran out without a confirmation
    ExpireGrace,
    /// Paid ticket cancelled without refund
    CancelPaid,
    /// Paid ticket cancelled with a refund recorded
    RefundPaid,
}

impl Transition {
    pub const ALL: [Transition; 6] = [
        Transition::ConfirmPayment,
        Transition::RequestCancellation,
        Transition::AbandonUnpaid,
        Transition::ExpireGrace,
        Transition::CancelPaid,
        Transition::RefundPaid,
    ];

    /// Statuses this transition may start from
    pub fn sources(&self) -> &'static [TicketStatus] {
        match self {
            Transition::ConfirmPayment => {
                &[TicketStatus::Pending, TicketStatus::PendingCancellation]
            }
            Transition::RequestCancellation | Transition::AbandonUnpaid => {
                &[TicketStatus::Pending]
            }
            Transition::ExpireGrace => &[TicketStatus::PendingCancellation],
            Transition::CancelPaid | Transition::RefundPaid => &[TicketStatus::Paid],
        }
    }

    pub fn target(&self) -> TicketStatus {
        match self {
            Transition::ConfirmPayment => TicketStatus::Paid,
            Transition::RequestCancellation => TicketStatus::PendingCancellation,
            Transition::AbandonUnpaid | Transition::ExpireGrace | Transition::CancelPaid => {
                TicketStatus::Cancelled
            }
            Transition::RefundPaid => TicketStatus::Refunded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::ConfirmPayment => "confirm_payment",
            Transition::RequestCancellation => "request_cancellation",
            Transition::AbandonUnpaid => "abandon_unpaid",
            Transition::ExpireGrace => "expire_grace",
            Transition::CancelPaid => "cancel_paid",
            Transition::RefundPaid => "refund_paid",
        }
    }
}

/// Whether the lifecycle graph has an edge from `from` to `to`
pub fn is_allowed(from: TicketStatus, to: TicketStatus) -> bool {
    Transition::ALL
        .iter()
        .any(|t| t.target() == to && t.sources().contains(&from))
}

/// A compare-and-set status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalUpdate {
    pub ticket_id: Uuid,
    pub transition: Transition,
    /// Payment reference recorded on first confirmation (write-once)
    pub payment_ref: Option<String>,
    pub refunded_amount_cents: i64,
    /// Only match rows whose `updated_at` is at or before this instant
    pub updated_not_after: Option<OffsetDateTime>,
    pub at: OffsetDateTime,
}

impl ConditionalUpdate {
    fn new(ticket_id: Uuid, transition: Transition, at: OffsetDateTime) -> Self {
        Self {
            ticket_id,
            transition,
            payment_ref: None,
            refunded_amount_cents: 0,
            updated_not_after: None,
            at,
        }
    }

    pub fn confirm_payment(
        ticket_id: Uuid,
        payment_ref: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            payment_ref: Some(payment_ref.into()),
            ..Self::new(ticket_id, Transition::ConfirmPayment, at)
        }
    }

    pub fn request_cancellation(ticket_id: Uuid, at: OffsetDateTime) -> Self {
        Self::new(ticket_id, Transition::RequestCancellation, at)
    }

    pub fn abandon_unpaid(ticket_id: Uuid, at: OffsetDateTime) -> Self {
        Self::new(ticket_id, Transition::AbandonUnpaid, at)
    }

    pub fn expire_grace(ticket_id: Uuid, at: OffsetDateTime) -> Self {
        Self::new(ticket_id, Transition::ExpireGrace, at)
    }

    pub fn cancel_paid(ticket_id: Uuid, at: OffsetDateTime) -> Self {
        Self::new(ticket_id, Transition::CancelPaid, at)
    }

    pub fn refund_paid(ticket_id: Uuid, refunded_amount_cents: i64, at: OffsetDateTime) -> Self {
        Self {
            refunded_amount_cents,
            ..Self::new(ticket_id, Transition::RefundPaid, at)
        }
    }

    /// Restrict the update to rows untouched since `cutoff`
    pub fn untouched_since(mut self, cutoff: OffsetDateTime) -> Self {
        self.updated_not_after = Some(cutoff);
        self
    }

    pub fn target(&self) -> TicketStatus {
        self.transition.target()
    }

    /// Whether this update would take effect on `record`
    pub fn matches(&self, record: &TicketRecord) -> bool {
        record.id == self.ticket_id
            && self.transition.sources().contains(&record.status)
            && self
                .updated_not_after
                .map_or(true, |cutoff| record.updated_at <= cutoff)
    }

    /// Apply the update in place, returning whether it took effect
    ///
    /// Reference semantics for every store implementation.
    pub fn apply_to(&self, record: &mut TicketRecord) -> bool {
        if !self.matches(record) {
            return false;
        }

        record.status = self.target();
        record.updated_at = self.at;

        match self.transition {
            Transition::ConfirmPayment => {
                if record.provider_payment_ref.is_none() {
                    record.provider_payment_ref = self.payment_ref.clone();
                }
            }
            Transition::RequestCancellation => {}
            Transition::AbandonUnpaid | Transition::ExpireGrace | Transition::CancelPaid => {
                record.refunded_amount_cents = 0;
                record.cancelled_at.get_or_insert(self.at);
            }
            Transition::RefundPaid => {
                record.refunded_amount_cents = self.refunded_amount_cents;
                record.refunded_at.get_or_insert(self.at);
            }
        }

        true
    }
}

/// Who asked for a cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationInitiator {
    /// Ticket holder cancelling their own ticket
    User,
    /// Organizer or platform admin acting on a single ticket
    Admin,
    /// Event cancelled or deactivated
    System,
}

impl CancellationInitiator {
    fn refund_percent(&self) -> i64 {
        match self {
            CancellationInitiator::User => 50,
            CancellationInitiator::Admin | CancellationInitiator::System => 100,
        }
    }
}

/// Outcome of the refund-eligibility policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefundDecision {
    pub eligible: bool,
    pub amount_cents: i64,
}

/// Refund owed when a paid ticket is cancelled at `now`
///
/// Eligible only if the event starts at least [`REFUND_CUTOFF`] later. User
/// cancellations get half the total, admin and system cancellations all of
/// it. Partial amounts are floored so we never over-refund.
pub fn refund_decision(
    total_amount_cents: i64,
    event_starts_at: OffsetDateTime,
    now: OffsetDateTime,
    initiator: CancellationInitiator,
) -> RefundDecision {
    if event_starts_at - now < REFUND_CUTOFF {
        return RefundDecision {
            eligible: false,
            amount_cents: 0,
        };
    }

    let amount =
        i128::from(total_amount_cents.max(0)) * i128::from(initiator.refund_percent()) / 100;

    RefundDecision {
        eligible: true,
        amount_cents: i64::try_from(amount).unwrap_or(total_amount_cents),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{EventInfo, NewTicket, PaymentProvider};
    use time::macros::datetime;

    const ALL_STATUSES: [TicketStatus; 5] = [
        TicketStatus::Pending,
        TicketStatus::Paid,
        TicketStatus::PendingCancellation,
        TicketStatus::Cancelled,
        TicketStatus::Refunded,
    ];

    fn pending_ticket(now: OffsetDateTime) -> TicketRecord {
        let event = EventInfo {
            id: Uuid::new_v4(),
            title: "Listening party".to_string(),
            starts_at: now + Duration::days(30),
            max_participants: 10,
            price_cents: 3000,
            pickup_fee_cents: 0,
            currency: "eur".to_string(),
            is_active: true,
        };
        NewTicket::new(Uuid::new_v4(), &event, PaymentProvider::Stripe, false, now)
            .unwrap()
            .into_record()
    }

    #[test]
    fn test_allowed_edges() {
        use TicketStatus::*;
        let allowed = [
            (Pending, Paid),
            (Pending, PendingCancellation),
            (Pending, Cancelled),
            (PendingCancellation, Paid),
            (PendingCancellation, Cancelled),
            (Paid, Cancelled),
            (Paid, Refunded),
        ];

        for from in ALL_STATUSES {
            for to in ALL_STATUSES {
                assert_eq!(
                    is_allowed(from, to),
                    allowed.contains(&(from, to)),
                    "edge {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_nothing_returns_to_pending() {
        for from in ALL_STATUSES {
            assert!(!is_allowed(from, TicketStatus::Pending));
        }
    }

    #[test]
    fn test_final_statuses_have_no_outgoing_edges() {
        for to in ALL_STATUSES {
            assert!(!is_allowed(TicketStatus::Cancelled, to));
            assert!(!is_allowed(TicketStatus::Refunded, to));
        }
    }

    #[test]
    fn test_confirm_sets_payment_ref_once() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let mut ticket = pending_ticket(now);

        let first = ConditionalUpdate::confirm_payment(ticket.id, "pi_first", now);
        assert!(first.apply_to(&mut ticket));
        assert_eq!(ticket.status, TicketStatus::Paid);
        assert_eq!(ticket.provider_payment_ref.as_deref(), Some("pi_first"));

        // Second confirmation loses: the ticket is no longer pending
        let second = ConditionalUpdate::confirm_payment(ticket.id, "pi_second", now);
        assert!(!second.apply_to(&mut ticket));
        assert_eq!(ticket.provider_payment_ref.as_deref(), Some("pi_first"));
    }

    #[test]
    fn test_confirm_reactivates_pending_cancellation() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let mut ticket = pending_ticket(now);

        assert!(ConditionalUpdate::request_cancellation(ticket.id, now).apply_to(&mut ticket));
        assert_eq!(ticket.status, TicketStatus::PendingCancellation);
        assert_eq!(ticket.cancelled_at, None);

        let later = now + Duration::minutes(2);
        assert!(ConditionalUpdate::confirm_payment(ticket.id, "pi_1", later).apply_to(&mut ticket));
        assert_eq!(ticket.status, TicketStatus::Paid);
        assert_eq!(ticket.updated_at, later);
    }

    #[test]
    fn test_untouched_since_guard() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let mut ticket = pending_ticket(now);
        ConditionalUpdate::request_cancellation(ticket.id, now).apply_to(&mut ticket);

        let too_early = ConditionalUpdate::expire_grace(ticket.id, now + Duration::minutes(3))
            .untouched_since(now - Duration::minutes(2));
        assert!(!too_early.apply_to(&mut ticket));
        assert_eq!(ticket.status, TicketStatus::PendingCancellation);

        let expired = ConditionalUpdate::expire_grace(ticket.id, now + Duration::minutes(6))
            .untouched_since(now + Duration::minutes(1));
        assert!(expired.apply_to(&mut ticket));
        assert_eq!(ticket.status, TicketStatus::Cancelled);
        assert_eq!(ticket.cancelled_at, Some(now + Duration::minutes(6)));
    }

    #[test]
    fn test_refund_records_amount_and_timestamp() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let mut ticket = pending_ticket(now);
        ConditionalUpdate::confirm_payment(ticket.id, "pi_1", now).apply_to(&mut ticket);

        assert!(ConditionalUpdate::refund_paid(ticket.id, 1500, now).apply_to(&mut ticket));
        assert_eq!(ticket.status, TicketStatus::Refunded);
        assert_eq!(ticket.refunded_amount_cents, 1500);
        assert_eq!(ticket.refunded_at, Some(now));
        assert_eq!(ticket.cancelled_at, None);
    }

    #[test]
    fn test_update_for_other_ticket_never_matches() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let mut ticket = pending_ticket(now);
        let update = ConditionalUpdate::confirm_payment(Uuid::new_v4(), "pi_1", now);
        assert!(!update.apply_to(&mut ticket));
        assert_eq!(ticket.status, TicketStatus::Pending);
    }

    #[test]
    fn test_user_refund_ten_days_out_is_half() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let decision = refund_decision(
            3000,
            now + Duration::days(10),
            now,
            CancellationInitiator::User,
        );
        assert_eq!(
            decision,
            RefundDecision {
                eligible: true,
                amount_cents: 1500
            }
        );
    }

    #[test]
    fn test_user_refund_three_days_out_is_zero() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let decision =
            refund_decision(3000, now + Duration::days(3), now, CancellationInitiator::User);
        assert!(!decision.eligible);
        assert_eq!(decision.amount_cents, 0);
    }

    #[test]
    fn test_admin_refund_is_full() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let decision = refund_decision(
            2999,
            now + Duration::days(8),
            now,
            CancellationInitiator::Admin,
        );
        assert_eq!(decision.amount_cents, 2999);
    }

    #[test]
    fn test_refund_cutoff_boundary_is_inclusive() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let exactly = refund_decision(1000, now + REFUND_CUTOFF, now, CancellationInitiator::User);
        assert!(exactly.eligible);

        let just_inside = refund_decision(
            1000,
            now + REFUND_CUTOFF - Duration::seconds(1),
            now,
            CancellationInitiator::System,
        );
        assert!(!just_inside.eligible);
    }

    #[test]
    fn test_half_refund_is_floored() {
        let now = datetime!(2030-01-10 10:00 UTC);
        let decision = refund_decision(
            2999,
            now + Duration::days(14),
            now,
            CancellationInitiator::User,
        );
        assert_eq!(decision.amount_cents, 1499);
    }
}

//! Ticket record and related types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Errors raised while building or decoding ticket data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("Unknown ticket status: {0}")]
    UnknownStatus(String),

    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("Amounts must not be negative")]
    NegativeAmount,

    #[error("Ticket total overflows")]
    AmountOverflow,
}

/// Lifecycle status of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Paid,
    PendingCancellation,
    Cancelled,
    Refunded,
}

impl TicketStatus {
    /// Statuses that hold a seat of the event's capacity
    pub const RESERVING: [TicketStatus; 3] = [
        TicketStatus::Pending,
        TicketStatus::Paid,
        TicketStatus::PendingCancellation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Paid => "paid",
            TicketStatus::PendingCancellation => "pending_cancellation",
            TicketStatus::Cancelled => "cancelled",
            TicketStatus::Refunded => "refunded",
        }
    }

    /// Whether a ticket in this status counts toward event capacity
    pub fn holds_capacity(&self) -> bool {
        Self::RESERVING.contains(self)
    }

    /// Terminal statuses accept no further transitions
    pub fn is_final(&self) -> bool {
        matches!(self, TicketStatus::Cancelled | TicketStatus::Refunded)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TicketStatus::Pending),
            "paid" => Ok(TicketStatus::Paid),
            "pending_cancellation" => Ok(TicketStatus::PendingCancellation),
            "cancelled" => Ok(TicketStatus::Cancelled),
            "refunded" => Ok(TicketStatus::Refunded),
            other => Err(TicketError::UnknownStatus(other.to_string())),
        }
    }
}

/// External payment provider a ticket is paid through
///
/// `provider_a` and `provider_b` are accepted as aliases on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentProvider {
    #[serde(rename = "stripe", alias = "provider_a")]
    Stripe,
    #[serde(rename = "paypal", alias = "provider_b")]
    Paypal,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Paypal => "paypal",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" | "provider_a" => Ok(PaymentProvider::Stripe),
            "paypal" | "provider_b" => Ok(PaymentProvider::Paypal),
            other => Err(TicketError::UnknownProvider(other.to_string())),
        }
    }
}

/// Read-only view of an event, owned by the event administration service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: Uuid,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    pub max_participants: i64,
    pub price_cents: i64,
    pub pickup_fee_cents: i64,
    pub currency: String,
    pub is_active: bool,
}

impl EventInfo {
    /// Bookings close once the event has started
    pub fn is_bookable(&self, now: OffsetDateTime) -> bool {
        self.is_active && self.starts_at > now
    }
}

/// A ticket ready to be inserted in `pending` status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicket {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub payment_provider: PaymentProvider,
    pub price_cents: i64,
    pub pickup_fee_cents: i64,
    pub pickup_selected: bool,
    pub total_amount_cents: i64,
    pub created_at: OffsetDateTime,
}

impl NewTicket {
    /// Build a pending ticket, computing the total from price and pickup fee
    pub fn new(
        user_id: Uuid,
        event: &EventInfo,
        payment_provider: PaymentProvider,
        pickup_selected: bool,
        now: OffsetDateTime,
    ) -> Result<Self, TicketError> {
        if event.price_cents < 0 || event.pickup_fee_cents < 0 {
            return Err(TicketError::NegativeAmount);
        }

        let total_amount_cents = if pickup_selected {
            event
                .price_cents
                .checked_add(event.pickup_fee_cents)
                .ok_or(TicketError::AmountOverflow)?
        } else {
            event.price_cents
        };

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            event_id: event.id,
            payment_provider,
            price_cents: event.price_cents,
            // The fee is only charged when pickup was selected
            pickup_fee_cents: if pickup_selected {
                event.pickup_fee_cents
            } else {
                0
            },
            pickup_selected,
            total_amount_cents,
            created_at: now,
        })
    }

    /// The record as it looks right after insertion
    pub fn into_record(self) -> TicketRecord {
        TicketRecord {
            id: self.id,
            user_id: self.user_id,
            event_id: self.event_id,
            status: TicketStatus::Pending,
            price_cents: self.price_cents,
            pickup_fee_cents: self.pickup_fee_cents,
            pickup_selected: self.pickup_selected,
            total_amount_cents: self.total_amount_cents,
            payment_provider: self.payment_provider,
            provider_session_id: None,
            provider_payment_ref: None,
            refunded_amount_cents: 0,
            refunded_at: None,
            cancelled_at: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Persisted admission ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub status: TicketStatus,
    pub price_cents: i64,
    pub pickup_fee_cents: i64,
    pub pickup_selected: bool,
    pub total_amount_cents: i64,
    pub payment_provider: PaymentProvider,
    pub provider_session_id: Option<String>,
    pub provider_payment_ref: Option<String>,
    pub refunded_amount_cents: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub refunded_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TicketRecord {
    /// End of the grace window for a ticket awaiting cancellation
    ///
    /// Nothing touches a `pending_cancellation` row until it leaves that
    /// status, so `updated_at` marks the moment the user cancelled.
    pub fn grace_deadline(&self, grace_window: Duration) -> Option<OffsetDateTime> {
        (self.status == TicketStatus::PendingCancellation).then(|| self.updated_at + grace_window)
    }

    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.created_at
    }

    /// Amount expected from pickup and price, used by consistency checks
    pub fn expected_total(&self) -> Option<i64> {
        if self.pickup_selected {
            self.price_cents.checked_add(self.pickup_fee_cents)
        } else {
            Some(self.price_cents)
        }
    }
}

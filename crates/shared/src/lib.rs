// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Eventpass shared types
//!
//! Domain types used by every Eventpass crate: the ticket record and its
//! lifecycle, the refund policy, and database pool helpers.

pub mod db;
pub mod lifecycle;
pub mod ticket;

pub use db::{create_pool, run_migrations};
pub use lifecycle::{
    is_allowed, refund_decision, CancellationInitiator, ConditionalUpdate, RefundDecision,
    Transition, REFUND_CUTOFF,
};
pub use ticket::{
    EventInfo, NewTicket, PaymentProvider, TicketError, TicketRecord, TicketStatus,
};

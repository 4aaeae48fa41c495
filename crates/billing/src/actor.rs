//! Who is acting on a ticket

use eventpass_shared::{CancellationInitiator, TicketRecord};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Ticket holder
    User(Uuid),
    /// Organizer or platform admin
    Admin(Uuid),
    /// Cancellation of a whole event, triggered by an admin
    EventCancellation { admin_id: Uuid },
}

impl Actor {
    pub fn id(&self) -> Uuid {
        match self {
            Actor::User(id) | Actor::Admin(id) => *id,
            Actor::EventCancellation { admin_id } => *admin_id,
        }
    }

    pub fn is_privileged(&self) -> bool {
        !matches!(self, Actor::User(_))
    }

    pub fn initiator(&self) -> CancellationInitiator {
        match self {
            Actor::User(_) => CancellationInitiator::User,
            Actor::Admin(_) => CancellationInitiator::Admin,
            Actor::EventCancellation { .. } => CancellationInitiator::System,
        }
    }

    /// Users may only act on their own tickets
    pub fn authorize(&self, ticket: &TicketRecord) -> BillingResult<()> {
        match self {
            Actor::User(user_id) if *user_id != ticket.user_id => Err(BillingError::NotTicketOwner),
            _ => Ok(()),
        }
    }
}

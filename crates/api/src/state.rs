//! Application state

use eventpass_billing::{BillingResult, TicketingService};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub tickets: TicketingService,
}

impl AppState {
    /// Wire the ticket services against Postgres and the configured providers
    pub fn new(pool: PgPool, config: Config) -> BillingResult<Self> {
        let tickets = TicketingService::from_env(pool)?;
        tracing::info!(
            grace_window_secs = tickets.config.grace_window.whole_seconds(),
            stale_pending_after_mins = tickets.config.stale_pending_after.whole_minutes(),
            "Ticket services initialized"
        );
        Ok(Self::with_service(tickets, config))
    }

    pub fn with_service(tickets: TicketingService, config: Config) -> Self {
        Self { config, tickets }
    }
}

//! HTTP routes

pub mod admin;
pub mod tickets;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_identity, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/tickets", post(tickets::create_ticket))
        .route(
            "/tickets/{id}",
            get(tickets::get_ticket).delete(tickets::cancel_ticket),
        )
        .route("/tickets/{id}/retry-checkout", post(tickets::retry_checkout))
        .route("/tickets/{id}/confirm-payment", post(tickets::confirm_payment))
        .route("/admin/events/{id}/cancel", post(admin::cancel_event))
        .route_layer(middleware::from_fn(require_identity));

    Router::new()
        .route("/health", get(health))
        .route("/providers/{provider}/webhook", post(webhooks::provider_webhook))
        .merge(authenticated)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

//! Ticket routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use eventpass_billing::{
    BillingError, BookedTicket, BookingRequest, CancellationOutcome, CancellationRequest,
    ConfirmationHints, ConfirmationStatus, RefundMode, RetryCheckoutOutcome, TicketStore,
};
use eventpass_shared::{PaymentProvider, TicketRecord};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub event_id: Uuid,
    pub provider: PaymentProvider,
    #[serde(default)]
    pub pickup_selected: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub refund: RefundMode,
}

/// Reserve a seat and return the checkout URL
pub async fn create_ticket(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateTicketRequest>,
) -> ApiResult<(StatusCode, Json<BookedTicket>)> {
    let booked = state
        .tickets
        .booking
        .book(
            BookingRequest {
                user_id: auth_user.user_id,
                event_id: req.event_id,
                provider: req.provider,
                pickup_selected: req.pickup_selected,
            },
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(booked)))
}

pub async fn get_ticket(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Json<TicketRecord>> {
    let ticket = state
        .tickets
        .store
        .get_ticket(ticket_id)
        .await?
        .ok_or(BillingError::TicketNotFound(ticket_id))?;
    auth_user.actor().authorize(&ticket)?;

    Ok(Json(ticket))
}

pub async fn retry_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Json<RetryCheckoutOutcome>> {
    let outcome = state
        .tickets
        .booking
        .retry_checkout(ticket_id, auth_user.user_id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(outcome))
}

/// Called when the buyer lands back from the provider's checkout page
pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Query(hints): Query<ConfirmationHints>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .tickets
        .confirmation
        .confirm(ticket_id, auth_user.actor(), hints, OffsetDateTime::now_utc())
        .await?;

    let response = match status {
        ConfirmationStatus::Paid => (StatusCode::OK, Json(json!({ "status": "paid" }))),
        ConfirmationStatus::Pending => (StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))),
        ConfirmationStatus::Final { ticket_status } => {
            (StatusCode::OK, Json(json!({ "status": ticket_status })))
        }
    };
    Ok(response)
}

pub async fn cancel_ticket(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticket_id): Path<Uuid>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<CancellationOutcome>> {
    let outcome = state
        .tickets
        .cancellation
        .cancel(
            CancellationRequest {
                ticket_id,
                actor: auth_user.actor(),
                refund_mode: query.refund,
            },
            OffsetDateTime::now_utc(),
        )
        .await?;

    tracing::info!(
        ticket_id = %ticket_id,
        user_id = %auth_user.user_id,
        outcome = ?outcome,
        "Ticket cancellation handled"
    );
    Ok(Json(outcome))
}

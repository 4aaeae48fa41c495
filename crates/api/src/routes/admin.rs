//! Admin routes

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use eventpass_billing::EventCancellationSummary;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Cancel every ticket still holding a seat at an event, refunding in full
pub async fn cancel_event(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<EventCancellationSummary>> {
    auth_user.require_admin()?;

    let summary = state
        .tickets
        .cancellation
        .cancel_event(event_id, auth_user.user_id, OffsetDateTime::now_utc())
        .await?;

    tracing::info!(
        event_id = %event_id,
        admin_id = %auth_user.user_id,
        cancelled = summary.cancelled,
        refunded = summary.refunded,
        errors = summary.errors,
        "Event cancelled"
    );
    Ok(Json(summary))
}

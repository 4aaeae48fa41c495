//! Payment provider webhook endpoint
//!
//! No caller identity here: the provider signature authenticates the request.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use eventpass_shared::PaymentProvider;
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let provider: PaymentProvider = provider
        .parse()
        .map_err(|_| ApiError::NotFound(format!("unknown payment provider '{provider}'")))?;

    let ack = state
        .tickets
        .webhooks
        .handle(provider, &headers, &body, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(json!({ "received": true, "result": ack })))
}

//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use eventpass_billing::BillingError;
use serde_json::json;

use crate::auth::AuthError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ApiError {
    /// Status code and stable error code for the response body
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Auth(AuthError::MissingIdentity) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Auth(AuthError::InvalidIdentity) => {
                (StatusCode::UNAUTHORIZED, "invalid_identity")
            }
            ApiError::Auth(AuthError::InsufficientPermissions) => {
                (StatusCode::FORBIDDEN, "forbidden")
            }
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Billing(e) => match e {
                BillingError::ProviderUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
                }
                BillingError::InvalidRequest(_) => (StatusCode::BAD_GATEWAY, "provider_rejected"),
                BillingError::WebhookSignatureInvalid => {
                    (StatusCode::UNAUTHORIZED, "invalid_webhook_signature")
                }
                BillingError::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "malformed_payload"),
                BillingError::TicketNotFound(_) => (StatusCode::NOT_FOUND, "ticket_not_found"),
                BillingError::EventNotFound(_) => (StatusCode::NOT_FOUND, "event_not_found"),
                BillingError::EventClosed => (StatusCode::CONFLICT, "event_closed"),
                BillingError::CapacityExceeded => (StatusCode::CONFLICT, "capacity_exceeded"),
                BillingError::NotTicketOwner => (StatusCode::FORBIDDEN, "not_ticket_owner"),
                BillingError::TicketNotPending(_) => (StatusCode::CONFLICT, "ticket_not_pending"),
                BillingError::RefundNotEligible => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "refund_not_eligible")
                }
                BillingError::Ticket(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_ticket"),
                BillingError::Inconsistent(_)
                | BillingError::Config(_)
                | BillingError::Database(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();

        // Internal details stay in the logs
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut response = (status, Json(json!({ "error": code, "message": message }))).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, axum::http::HeaderValue::from_static("5"));
        }
        response
    }
}

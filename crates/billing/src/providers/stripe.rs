//! Stripe checkout adapter

use std::collections::HashMap;

use async_trait::async_trait;
use eventpass_shared::{EventInfo, PaymentProvider, TicketRecord};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use sha2::Sha256;
use stripe::{
    CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus, CheckoutSessionStatus,
    Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateRefund, Currency, ErrorCode, Expandable, PaymentIntentId, Refund, RefundReasonFilter,
    RequestStrategy, StripeError,
};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use super::{
    CheckoutSession, PaymentGateway, ProviderEvent, ProviderEventKind, RefundOutcome,
    SessionStatus,
};
use crate::config::StripeConfig;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds
const SIGNATURE_TOLERANCE_SECS: u64 = 300;

pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = match &config.api_base {
            Some(base) => Client::from_url(base.as_str(), config.secret_key.clone()),
            None => Client::new(config.secret_key.clone()),
        };
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }
}

fn map_stripe_error(err: StripeError) -> BillingError {
    match err {
        StripeError::Stripe(req) if req.http_status >= 500 || req.http_status == 429 => {
            BillingError::ProviderUnavailable(format!(
                "stripe returned {}: {}",
                req.http_status,
                req.message.unwrap_or_default()
            ))
        }
        StripeError::Stripe(req) => BillingError::InvalidRequest(
            req.message
                .unwrap_or_else(|| format!("stripe returned {}", req.http_status)),
        ),
        StripeError::Timeout => BillingError::ProviderUnavailable("stripe timed out".to_string()),
        StripeError::ClientError(msg) => BillingError::ProviderUnavailable(msg),
        other => BillingError::InvalidRequest(other.to_string()),
    }
}

fn parse_session_id(session_id: &str) -> BillingResult<CheckoutSessionId> {
    session_id
        .parse()
        .map_err(|_| BillingError::InvalidRequest(format!("Bad session id: {session_id}")))
}

fn parse_currency(code: &str) -> BillingResult<Currency> {
    serde_json::from_value(serde_json::Value::String(code.to_lowercase()))
        .map_err(|_| BillingError::InvalidRequest(format!("Unsupported currency: {code}")))
}

fn status_from_session(session: &stripe::CheckoutSession) -> SessionStatus {
    if session.payment_status == CheckoutSessionPaymentStatus::Paid {
        let payment_intent = session.payment_intent.as_ref().map(|pi| match pi {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(intent) => intent.id.to_string(),
        });
        return match payment_intent {
            Some(payment_ref) => SessionStatus::Completed { payment_ref },
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    "Paid checkout session without payment intent"
                );
                SessionStatus::NotCompleted
            }
        };
    }

    if session.status == Some(CheckoutSessionStatus::Expired) {
        return SessionStatus::Failed {
            reason: "checkout session expired".to_string(),
        };
    }

    SessionStatus::NotCompleted
}

/// Verify a `Stripe-Signature` header against the raw payload
///
/// The header carries `t=<unix>` and one or more `v1=<hex hmac>` entries; any
/// matching `v1` is accepted.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in Stripe-Signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in Stripe-Signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if now_unix.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Stripe webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid Stripe webhook secret".to_string()))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));

    if matched {
        Ok(())
    } else {
        tracing::warn!("Stripe webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Build a `Stripe-Signature` header value for a payload
#[cfg(any(test, feature = "test-util"))]
pub fn signature_header(payload: &str, secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct StripeEventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeEventObject,
}

/// The subset of a checkout session object that webhooks need
#[derive(Debug, Default, Deserialize)]
struct StripeEventObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    /// Either an id or an expanded object
    #[serde(default)]
    payment_intent: Option<serde_json::Value>,
}

impl StripeEventObject {
    fn payment_intent_id(&self) -> Option<String> {
        match self.payment_intent.as_ref()? {
            serde_json::Value::String(id) => Some(id.clone()),
            serde_json::Value::Object(obj) => obj.get("id")?.as_str().map(str::to_string),
            _ => None,
        }
    }
}

/// Parse a verified Stripe payload into a provider event
pub fn parse_event(payload: &str) -> BillingResult<ProviderEvent> {
    let envelope: StripeEventEnvelope = serde_json::from_str(payload)
        .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

    let kind = classify(&envelope.event_type, &envelope.data.object);
    Ok(ProviderEvent {
        event_id: envelope.id,
        event_type: envelope.event_type,
        kind,
    })
}

fn classify(event_type: &str, object: &StripeEventObject) -> ProviderEventKind {
    let Some(session_id) = object.id.clone() else {
        return ProviderEventKind::Ignored;
    };

    match event_type {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            // Delayed payment methods complete the session before the money arrives
            if object.payment_status.as_deref() != Some("paid") {
                return ProviderEventKind::Ignored;
            }
            match object.payment_intent_id() {
                Some(payment_ref) => ProviderEventKind::PaymentCompleted {
                    session_id,
                    payment_ref,
                },
                None => ProviderEventKind::Ignored,
            }
        }
        "checkout.session.async_payment_failed" => ProviderEventKind::PaymentFailed {
            session_id: Some(session_id),
            reason: "async payment failed".to_string(),
        },
        "checkout.session.expired" => ProviderEventKind::PaymentFailed {
            session_id: Some(session_id),
            reason: "checkout session expired".to_string(),
        },
        _ => ProviderEventKind::Ignored,
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    async fn create_checkout_session(
        &self,
        ticket: &TicketRecord,
        event: &EventInfo,
    ) -> BillingResult<CheckoutSession> {
        let currency = parse_currency(self.config.urls.currency_for(&event.currency))?;
        let success_url = self.config.urls.success_for(ticket.id);
        let cancel_url = self.config.urls.cancel_for(ticket.id);
        let ticket_id = ticket.id.to_string();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Payment);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.client_reference_id = Some(&ticket_id);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(ticket.total_amount_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: event.title.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let mut metadata = HashMap::new();
        metadata.insert("ticket_id".to_string(), ticket_id.clone());
        metadata.insert("event_id".to_string(), event.id.to_string());
        params.metadata = Some(metadata);

        let session = stripe::CheckoutSession::create(&self.client, params)
            .await
            .map_err(map_stripe_error)?;

        let checkout_url = session.url.clone().ok_or_else(|| {
            BillingError::InvalidRequest("Stripe session has no checkout URL".to_string())
        })?;

        tracing::info!(
            ticket_id = %ticket.id,
            session_id = %session.id,
            amount_cents = ticket.total_amount_cents,
            "Created Stripe checkout session"
        );

        Ok(CheckoutSession {
            session_id: session.id.to_string(),
            checkout_url,
        })
    }

    async fn session_status(&self, session_id: &str) -> BillingResult<SessionStatus> {
        let id = parse_session_id(session_id)?;

        let session = stripe::CheckoutSession::retrieve(&self.client, &id, &[])
            .await
            .map_err(map_stripe_error)?;

        Ok(status_from_session(&session))
    }

    async fn expire_session(&self, session_id: &str) -> BillingResult<SessionStatus> {
        let id = parse_session_id(session_id)?;

        let expired = self
            .client
            .post::<stripe::CheckoutSession>(&format!("/checkout/sessions/{id}/expire"))
            .await
            .map_err(map_stripe_error);

        match expired {
            Ok(session) => {
                tracing::info!(session_id = %id, "Expired Stripe checkout session");
                Ok(status_from_session(&session))
            }
            // Only open sessions can be expired; a closed one reports its outcome
            Err(BillingError::InvalidRequest(reason)) => {
                let session = stripe::CheckoutSession::retrieve(&self.client, &id, &[])
                    .await
                    .map_err(map_stripe_error)?;
                match status_from_session(&session) {
                    SessionStatus::NotCompleted => Err(BillingError::InvalidRequest(reason)),
                    closed => Ok(closed),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn refund(
        &self,
        payment_ref: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> BillingResult<RefundOutcome> {
        let payment_intent: PaymentIntentId = payment_ref.parse().map_err(|_| {
            BillingError::InvalidRequest(format!("Bad payment intent id: {payment_ref}"))
        })?;

        let mut params = CreateRefund::new();
        params.payment_intent = Some(payment_intent);
        params.amount = Some(amount_cents);
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let client = self
            .client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(idempotency_key.to_string()));

        match Refund::create(&client, params).await {
            Ok(refund) => Ok(RefundOutcome::Refunded {
                refund_id: refund.id.to_string(),
            }),
            Err(StripeError::Stripe(req)) if req.code == Some(ErrorCode::ChargeAlreadyRefunded) => {
                Ok(RefundOutcome::AlreadyRefunded)
            }
            Err(e) => Err(map_stripe_error(e)),
        }
    }

    async fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &str,
    ) -> BillingResult<ProviderEvent> {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(BillingError::WebhookSignatureInvalid)?;

        verify_signature(
            payload,
            signature,
            &self.config.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        parse_event(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_900_000_000;

    fn completed_payload(payment_status: &str) -> String {
        serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {
                "object": {
                    "id": "cs_test_1",
                    "object": "checkout.session",
                    "payment_status": payment_status,
                    "payment_intent": "pi_123"
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = completed_payload("paid");
        let header = signature_header(&payload, SECRET, NOW);
        assert!(verify_signature(&payload, &header, SECRET, NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = completed_payload("paid");
        let header = signature_header(&payload, SECRET, NOW);
        let tampered = payload.replace("pi_123", "pi_999");
        assert!(matches!(
            verify_signature(&tampered, &header, SECRET, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = completed_payload("paid");
        let header = signature_header(&payload, "whsec_other", NOW);
        assert!(verify_signature(&payload, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = completed_payload("paid");
        let header = signature_header(&payload, SECRET, NOW);
        assert!(verify_signature(&payload, &header, SECRET, NOW + 301).is_err());
        assert!(verify_signature(&payload, &header, SECRET, NOW + 300).is_ok());
    }

    #[test]
    fn test_extreme_timestamp_rejected_without_overflow() {
        let payload = completed_payload("paid");
        assert!(matches!(
            verify_signature(&payload, "t=-9223372036854775808,v1=00", SECRET, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
        assert!(matches!(
            verify_signature(&payload, "t=9223372036854775807,v1=00", SECRET, i64::MIN),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = completed_payload("paid");
        let valid = signature_header(&payload, SECRET, NOW);
        let v1 = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1=deadbeef,v1={v1}");
        assert!(verify_signature(&payload, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn test_missing_parts_rejected() {
        let payload = completed_payload("paid");
        assert!(verify_signature(&payload, "v1=abc", SECRET, NOW).is_err());
        assert!(verify_signature(&payload, &format!("t={NOW}"), SECRET, NOW).is_err());
        assert!(verify_signature(&payload, "", SECRET, NOW).is_err());
    }

    #[test]
    fn test_paid_session_completes() {
        let event = parse_event(&completed_payload("paid")).unwrap();
        assert_eq!(event.event_id, "evt_1");
        assert_eq!(
            event.kind,
            ProviderEventKind::PaymentCompleted {
                session_id: "cs_test_1".to_string(),
                payment_ref: "pi_123".to_string(),
            }
        );
    }

    #[test]
    fn test_unpaid_completed_session_ignored() {
        let event = parse_event(&completed_payload("unpaid")).unwrap();
        assert_eq!(event.kind, ProviderEventKind::Ignored);
    }

    #[test]
    fn test_expanded_payment_intent() {
        let payload = serde_json::json!({
            "id": "evt_2",
            "type": "checkout.session.async_payment_succeeded",
            "data": { "object": {
                "id": "cs_test_2",
                "payment_status": "paid",
                "payment_intent": { "id": "pi_expanded", "object": "payment_intent" }
            }}
        })
        .to_string();
        let event = parse_event(&payload).unwrap();
        assert!(matches!(
            event.kind,
            ProviderEventKind::PaymentCompleted { ref payment_ref, .. } if payment_ref == "pi_expanded"
        ));
    }

    #[test]
    fn test_expired_session_fails() {
        let payload = serde_json::json!({
            "id": "evt_3",
            "type": "checkout.session.expired",
            "data": { "object": { "id": "cs_test_3", "payment_status": "unpaid" } }
        })
        .to_string();
        let event = parse_event(&payload).unwrap();
        assert!(matches!(event.kind, ProviderEventKind::PaymentFailed { .. }));
    }

    #[test]
    fn test_unrelated_event_ignored() {
        let payload = serde_json::json!({
            "id": "evt_4",
            "type": "customer.created",
            "data": { "object": { "id": "cus_1", "email": "a@b.c" } }
        })
        .to_string();
        assert_eq!(parse_event(&payload).unwrap().kind, ProviderEventKind::Ignored);
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        assert!(matches!(
            parse_event("{not json"),
            Err(BillingError::MalformedPayload(_))
        ));
        assert!(matches!(
            parse_event(r#"{"id":"evt_5"}"#),
            Err(BillingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!(parse_currency("EUR").unwrap(), Currency::EUR);
        assert!(parse_currency("zzz").is_err());
    }
}

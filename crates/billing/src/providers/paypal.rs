//! PayPal Orders v2 adapter
//!
//! A PayPal order is the checkout session: its id is stored as
//! `provider_session_id` and the capture id becomes the payment reference.
//! Orders are created with `intent = CAPTURE` and must be captured once the
//! buyer approves them, which [`PaypalGateway::finalize_approved`] does.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventpass_shared::{EventInfo, PaymentProvider, TicketRecord};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{
    CheckoutSession, PaymentGateway, ProviderEvent, ProviderEventKind, RefundOutcome,
    SessionStatus,
};
use crate::config::PaypalConfig;
use crate::error::{BillingError, BillingResult};

/// Tokens are refreshed this long before PayPal expires them
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const WEBHOOK_HEADERS: [&str; 5] = [
    "paypal-auth-algo",
    "paypal-cert-url",
    "paypal-transmission-id",
    "paypal-transmission-sig",
    "paypal-transmission-time",
];

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

pub struct PaypalGateway {
    http: reqwest::Client,
    config: PaypalConfig,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct PaypalOrder {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
    #[serde(default)]
    links: Vec<PaypalLink>,
}

#[derive(Debug, Default, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<PurchaseUnitPayments>,
}

#[derive(Debug, Default, Deserialize)]
struct PurchaseUnitPayments {
    #[serde(default)]
    captures: Vec<PaypalCapture>,
}

#[derive(Debug, Deserialize)]
struct PaypalCapture {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<PaypalAmount>,
}

#[derive(Debug, Deserialize)]
struct PaypalAmount {
    currency_code: String,
}

#[derive(Debug, Deserialize)]
struct PaypalLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PaypalRefund {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PaypalErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<PaypalErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct PaypalErrorDetail {
    issue: String,
}

impl PaypalErrorBody {
    fn has_issue(&self, issue: &str) -> bool {
        self.details.iter().any(|d| d.issue == issue)
    }

    fn describe(&self) -> String {
        let mut text = self
            .name
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        if let Some(first) = self.details.first() {
            text.push_str(": ");
            text.push_str(&first.issue);
        }
        text
    }
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

/// Format minor units the way PayPal expects amounts
fn format_amount(cents: i64, currency: &str) -> String {
    match currency.to_uppercase().as_str() {
        "JPY" | "HUF" | "TWD" => cents.to_string(),
        _ => {
            let sign = if cents < 0 { "-" } else { "" };
            let abs = cents.unsigned_abs();
            format!("{sign}{}.{:02}", abs / 100, abs % 100)
        }
    }
}

fn first_capture(order: &PaypalOrder) -> Option<&PaypalCapture> {
    order
        .purchase_units
        .iter()
        .filter_map(|unit| unit.payments.as_ref())
        .flat_map(|payments| payments.captures.iter())
        .next()
}

fn status_from_order(order: &PaypalOrder) -> SessionStatus {
    match order.status.as_str() {
        "COMPLETED" => match first_capture(order) {
            Some(capture) if capture.status.as_deref() != Some("DECLINED") => {
                SessionStatus::Completed {
                    payment_ref: capture.id.clone(),
                }
            }
            Some(_) => SessionStatus::Failed {
                reason: "capture declined".to_string(),
            },
            None => {
                tracing::warn!(order_id = %order.id, "Completed PayPal order without capture");
                SessionStatus::NotCompleted
            }
        },
        "VOIDED" => SessionStatus::Failed {
            reason: "order voided".to_string(),
        },
        _ => SessionStatus::NotCompleted,
    }
}

async fn error_body(response: Response) -> (StatusCode, PaypalErrorBody) {
    let status = response.status();
    let body = response.json::<PaypalErrorBody>().await.unwrap_or_default();
    (status, body)
}

fn classify_failure(status: StatusCode, body: &PaypalErrorBody) -> BillingError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BillingError::ProviderUnavailable(format!("paypal returned {status}: {}", body.describe()))
    } else {
        BillingError::InvalidRequest(format!("paypal returned {status}: {}", body.describe()))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> BillingResult<T> {
    if response.status().is_success() {
        Ok(response.json::<T>().await?)
    } else {
        let (status, body) = error_body(response).await;
        Err(classify_failure(status, &body))
    }
}

impl PaypalGateway {
    pub fn new(config: PaypalConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: RwLock::new(None),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(PaypalConfig::from_env()?))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> BillingResult<String> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.refresh_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(cached) = slot.as_ref() {
            if cached.refresh_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = read_json(response).await?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *slot = Some(CachedToken {
            access_token: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        tracing::debug!(expires_in = token.expires_in, "Refreshed PayPal access token");
        Ok(token.access_token)
    }

    async fn authorized(&self, request: RequestBuilder) -> BillingResult<RequestBuilder> {
        Ok(request.bearer_auth(self.access_token().await?))
    }

    async fn get_order(&self, order_id: &str) -> BillingResult<PaypalOrder> {
        let request = self
            .authorized(self.http.get(self.url(&format!("/v2/checkout/orders/{order_id}"))))
            .await?;
        read_json(request.send().await?).await
    }

    async fn capture_order(&self, order_id: &str) -> BillingResult<PaypalOrder> {
        let request = self
            .authorized(
                self.http
                    .post(self.url(&format!("/v2/checkout/orders/{order_id}/capture")))
                    .header("PayPal-Request-Id", format!("capture-{order_id}"))
                    .json(&json!({})),
            )
            .await?;
        let response = request.send().await?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let (status, body) = error_body(response).await;
            if body.has_issue("ORDER_ALREADY_CAPTURED") {
                tracing::debug!(order_id = %order_id, "PayPal order already captured");
                return self.get_order(order_id).await;
            }
            return Err(classify_failure(status, &body));
        }

        read_json(response).await
    }

    async fn capture_currency(&self, capture_id: &str) -> BillingResult<String> {
        let request = self
            .authorized(
                self.http
                    .get(self.url(&format!("/v2/payments/captures/{capture_id}"))),
            )
            .await?;
        let capture: PaypalCapture = read_json(request.send().await?).await?;
        capture
            .amount
            .map(|a| a.currency_code)
            .ok_or_else(|| BillingError::InvalidRequest("PayPal capture has no amount".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct PaypalWebhookEvent {
    id: String,
    event_type: String,
    #[serde(default)]
    resource: PaypalResource,
}

#[derive(Debug, Default, Deserialize)]
struct PaypalResource {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    supplementary_data: Option<SupplementaryData>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Default, Deserialize)]
struct SupplementaryData {
    #[serde(default)]
    related_ids: Option<RelatedIds>,
}

#[derive(Debug, Default, Deserialize)]
struct RelatedIds {
    #[serde(default)]
    order_id: Option<String>,
}

impl PaypalResource {
    fn related_order_id(&self) -> Option<String> {
        self.supplementary_data
            .as_ref()?
            .related_ids
            .as_ref()?
            .order_id
            .clone()
    }
}

/// Parse a verified PayPal webhook payload into a provider event
pub fn parse_event(payload: &str) -> BillingResult<ProviderEvent> {
    let event: PaypalWebhookEvent = serde_json::from_str(payload)
        .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

    let resource = &event.resource;
    let kind = match event.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" => match (resource.related_order_id(), resource.id.clone()) {
            (Some(session_id), Some(payment_ref)) => ProviderEventKind::PaymentCompleted {
                session_id,
                payment_ref,
            },
            _ => ProviderEventKind::Ignored,
        },
        "CHECKOUT.ORDER.COMPLETED" => {
            let capture = resource
                .purchase_units
                .iter()
                .filter_map(|unit| unit.payments.as_ref())
                .flat_map(|payments| payments.captures.iter())
                .next();
            match (resource.id.clone(), capture) {
                (Some(session_id), Some(capture)) => ProviderEventKind::PaymentCompleted {
                    session_id,
                    payment_ref: capture.id.clone(),
                },
                // Without the capture in the payload, look the order up
                (Some(session_id), None) => ProviderEventKind::CheckoutApproved { session_id },
                _ => ProviderEventKind::Ignored,
            }
        }
        "CHECKOUT.ORDER.APPROVED" => match resource.id.clone() {
            Some(session_id) => ProviderEventKind::CheckoutApproved { session_id },
            None => ProviderEventKind::Ignored,
        },
        "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => ProviderEventKind::PaymentFailed {
            session_id: resource.related_order_id(),
            reason: resource
                .status
                .clone()
                .unwrap_or_else(|| event.event_type.clone()),
        },
        _ => ProviderEventKind::Ignored,
    };

    Ok(ProviderEvent {
        event_id: event.id,
        event_type: event.event_type,
        kind,
    })
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Paypal
    }

    async fn create_checkout_session(
        &self,
        ticket: &TicketRecord,
        event: &EventInfo,
    ) -> BillingResult<CheckoutSession> {
        let currency = self.config.urls.currency_for(&event.currency).to_uppercase();
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": ticket.id.to_string(),
                "custom_id": ticket.id.to_string(),
                "description": event.title,
                "amount": {
                    "currency_code": currency,
                    "value": format_amount(ticket.total_amount_cents, &currency),
                },
            }],
            "application_context": {
                "brand_name": self.config.brand_name,
                "user_action": "PAY_NOW",
                "shipping_preference": "NO_SHIPPING",
                "return_url": self.config.urls.success_for(ticket.id),
                "cancel_url": self.config.urls.cancel_for(ticket.id),
            },
        });

        let request = self
            .authorized(self.http.post(self.url("/v2/checkout/orders")).json(&body))
            .await?;
        let order: PaypalOrder = read_json(request.send().await?).await?;

        let checkout_url = order
            .links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href.clone())
            .ok_or_else(|| {
                BillingError::InvalidRequest("PayPal order has no approval link".to_string())
            })?;

        tracing::info!(
            ticket_id = %ticket.id,
            order_id = %order.id,
            amount_cents = ticket.total_amount_cents,
            "Created PayPal order"
        );

        Ok(CheckoutSession {
            session_id: order.id,
            checkout_url,
        })
    }

    async fn session_status(&self, session_id: &str) -> BillingResult<SessionStatus> {
        let order = self.get_order(session_id).await?;
        Ok(status_from_order(&order))
    }

    async fn finalize_approved(&self, session_id: &str) -> BillingResult<SessionStatus> {
        let order = self.get_order(session_id).await?;
        if order.status != "APPROVED" {
            return Ok(status_from_order(&order));
        }

        tracing::info!(order_id = %session_id, "Capturing approved PayPal order");
        let captured = self.capture_order(session_id).await?;
        Ok(status_from_order(&captured))
    }

    async fn expire_session(&self, session_id: &str) -> BillingResult<SessionStatus> {
        let order = self.get_order(session_id).await?;
        match order.status.as_str() {
            // Buyer approved on the old tab
            "APPROVED" => {
                tracing::info!(
                    order_id = %session_id,
                    "Capturing approved PayPal order before replacing it"
                );
                let captured = self.capture_order(session_id).await?;
                Ok(status_from_order(&captured))
            }
            "COMPLETED" => Ok(status_from_order(&order)),
            // Nothing moves money on an unapproved order until we capture it
            _ => Ok(SessionStatus::Failed {
                reason: format!("order replaced while {}", order.status.to_lowercase()),
            }),
        }
    }

    async fn refund(
        &self,
        payment_ref: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> BillingResult<RefundOutcome> {
        let currency = self.capture_currency(payment_ref).await?;
        let body = json!({
            "amount": {
                "currency_code": currency,
                "value": format_amount(amount_cents, &currency),
            },
        });

        let request = self
            .authorized(
                self.http
                    .post(self.url(&format!("/v2/payments/captures/{payment_ref}/refund")))
                    .header("PayPal-Request-Id", idempotency_key)
                    .json(&body),
            )
            .await?;
        let response = request.send().await?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let (status, body) = error_body(response).await;
            if body.has_issue("CAPTURE_FULLY_REFUNDED") {
                return Ok(RefundOutcome::AlreadyRefunded);
            }
            return Err(classify_failure(status, &body));
        }

        let refund: PaypalRefund = read_json(response).await?;
        Ok(RefundOutcome::Refunded {
            refund_id: refund.id,
        })
    }

    async fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &str,
    ) -> BillingResult<ProviderEvent> {
        let mut values = Vec::with_capacity(WEBHOOK_HEADERS.len());
        for name in WEBHOOK_HEADERS {
            let value = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    tracing::warn!(header = name, "PayPal webhook missing signature header");
                    BillingError::WebhookSignatureInvalid
                })?;
            values.push(value.to_string());
        }

        let webhook_event: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        let body = json!({
            "auth_algo": values[0],
            "cert_url": values[1],
            "transmission_id": values[2],
            "transmission_sig": values[3],
            "transmission_time": values[4],
            "webhook_id": self.config.webhook_id,
            "webhook_event": webhook_event,
        });

        let request = self
            .authorized(
                self.http
                    .post(self.url("/v1/notifications/verify-webhook-signature"))
                    .json(&body),
            )
            .await?;
        let verification: VerifySignatureResponse = read_json(request.send().await?).await?;

        if verification.verification_status != "SUCCESS" {
            tracing::warn!(
                status = %verification.verification_status,
                "PayPal webhook signature rejected"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        parse_event(payload)
    }
}

//! Reconciliation and provider configuration, read from the environment

use std::str::FromStr;

use time::Duration;

use crate::error::{BillingError, BillingResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = key, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_required(key: &str) -> BillingResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{key} must be set")))
}

/// Timing policy shared by every reconciler
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How long a user-cancelled unpaid ticket can still be reactivated
    pub grace_window: Duration,
    /// Fast-poll covers tickets younger than this
    pub fast_poll_window: Duration,
    /// Regular-poll covers tickets younger than this (and older than the fast window)
    pub regular_poll_window: Duration,
    /// Pending tickets untouched for this long are abandoned
    pub stale_pending_after: Duration,
    /// Upper bound on any single provider call
    pub provider_timeout: std::time::Duration,
    /// Maximum tickets handled per loop iteration
    pub poll_batch_size: i64,
    /// Attempts at creating a checkout session before giving up
    pub checkout_retry_attempts: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::minutes(5),
            fast_poll_window: Duration::seconds(30),
            regular_poll_window: Duration::minutes(30),
            stale_pending_after: Duration::minutes(60),
            provider_timeout: std::time::Duration::from_secs(10),
            poll_batch_size: 200,
            checkout_retry_attempts: 3,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            grace_window: Duration::seconds(env_or(
                "GRACE_WINDOW_SECS",
                defaults.grace_window.whole_seconds(),
            )),
            fast_poll_window: defaults.fast_poll_window,
            regular_poll_window: defaults.regular_poll_window,
            stale_pending_after: Duration::minutes(env_or(
                "STALE_PENDING_AFTER_MINUTES",
                defaults.stale_pending_after.whole_minutes(),
            )),
            provider_timeout: std::time::Duration::from_secs(env_or(
                "PROVIDER_TIMEOUT_SECS",
                defaults.provider_timeout.as_secs(),
            )),
            poll_batch_size: env_or("POLL_BATCH_SIZE", defaults.poll_batch_size),
            checkout_retry_attempts: env_or(
                "CHECKOUT_RETRY_ATTEMPTS",
                defaults.checkout_retry_attempts,
            )
            .max(1),
        }
    }
}

/// Checkout presentation shared by both providers
///
/// `{ticket_id}` in either URL is replaced with the ticket id. The currency
/// applies to events that do not carry their own.
#[derive(Debug, Clone)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
    pub default_currency: String,
}

impl CheckoutUrls {
    pub fn from_env() -> Self {
        Self {
            default_currency: std::env::var("CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or_else(|_| "eur".to_string()),
            success_url: std::env::var("CHECKOUT_SUCCESS_URL").unwrap_or_else(|_| {
                "http://localhost:3000/tickets/{ticket_id}/return".to_string()
            }),
            cancel_url: std::env::var("CHECKOUT_CANCEL_URL").unwrap_or_else(|_| {
                "http://localhost:3000/tickets/{ticket_id}/cancelled".to_string()
            }),
        }
    }

    pub fn success_for(&self, ticket_id: uuid::Uuid) -> String {
        self.success_url.replace("{ticket_id}", &ticket_id.to_string())
    }

    pub fn cancel_for(&self, ticket_id: uuid::Uuid) -> String {
        self.cancel_url.replace("{ticket_id}", &ticket_id.to_string())
    }

    pub fn currency_for<'a>(&'a self, event_currency: &'a str) -> &'a str {
        if event_currency.is_empty() {
            &self.default_currency
        } else {
            event_currency
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Override for the Stripe API base URL (test doubles)
    pub api_base: Option<String>,
    pub urls: CheckoutUrls,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: env_required("STRIPE_SECRET_KEY")?,
            webhook_secret: env_required("STRIPE_WEBHOOK_SECRET")?,
            api_base: std::env::var("STRIPE_API_BASE").ok(),
            urls: CheckoutUrls::from_env(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub api_base: String,
    pub brand_name: String,
    pub urls: CheckoutUrls,
}

impl PaypalConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            client_id: env_required("PAYPAL_CLIENT_ID")?,
            client_secret: env_required("PAYPAL_CLIENT_SECRET")?,
            webhook_id: env_required("PAYPAL_WEBHOOK_ID")?,
            api_base: std::env::var("PAYPAL_API_BASE")
                .unwrap_or_else(|_| "https://api-m.paypal.com".to_string()),
            brand_name: std::env::var("PAYPAL_BRAND_NAME")
                .unwrap_or_else(|_| "Eventpass".to_string()),
            urls: CheckoutUrls::from_env(),
        })
    }
}

/// Outgoing mail settings; sending is disabled without an API key
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: Option<String>,
    pub from_address: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Eventpass <tickets@eventpass.local>".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_windows() {
        let config = ReconcileConfig::default();
        assert_eq!(config.grace_window, Duration::minutes(5));
        assert_eq!(config.fast_poll_window, Duration::seconds(30));
        assert_eq!(config.regular_poll_window, Duration::minutes(30));
        assert!(config.stale_pending_after > config.regular_poll_window);
    }

    #[test]
    fn test_checkout_urls_substitute_ticket_id() {
        let urls = CheckoutUrls {
            success_url: "https://tickets.example/{ticket_id}/done".to_string(),
            cancel_url: "https://tickets.example/back".to_string(),
            default_currency: "eur".to_string(),
        };
        let id = uuid::Uuid::nil();
        assert_eq!(
            urls.success_for(id),
            "https://tickets.example/00000000-0000-0000-0000-000000000000/done"
        );
        assert_eq!(urls.cancel_for(id), "https://tickets.example/back");
        assert_eq!(urls.currency_for(""), "eur");
        assert_eq!(urls.currency_for("usd"), "usd");
    }
}

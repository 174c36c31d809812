//! Payment provider adapters.
//!
//! Each provider is reached through a [`PaymentAdapter`] that creates a
//! provider-side payment object and later confirms it, producing a
//! provider-neutral [`ConfirmationReceipt`]. The reconciler never looks at
//! provider-specific payloads.

pub mod paypal;
pub mod stripe;

use crate::{config::AppConfig, entities::order::OrderLine, errors::ServiceError, services::coupons::round_money};
use async_trait::async_trait;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::info;
use uuid::Uuid;

pub use paypal::{PayPalAdapter, PayPalConfig};
pub use stripe::{StripeAdapter, StripeConfig};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    PayPal,
}

/// Everything an adapter needs to open a payment. Amounts are computed
/// server-side from the live catalogue and coupon.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    /// Local order id, sent to the provider as reference and idempotency key.
    pub order_reference: Uuid,
    pub amount: Decimal,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub currency: String,
    pub items: Vec<OrderLine>,
    pub coupon_code: Option<String>,
    pub customer_email: Option<String>,
}

/// Handle of a provider-side payment object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub provider: PaymentProvider,
    pub session_id: String,
    /// Stripe client secret for confirming the intent in the browser.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// PayPal page where the payer approves the order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
}

impl PaymentSession {
    pub fn new(provider: PaymentProvider, session_id: impl Into<String>) -> Self {
        Self {
            provider,
            session_id: session_id.into(),
            client_secret: None,
            approval_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    /// The payer still has to act (redirect, 3-D Secure, approval).
    RequiresAction,
    Declined,
    Cancelled,
}

/// Provider identifiers of a confirmed payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderReceipt {
    Stripe {
        payment_intent_id: String,
        charge_id: Option<String>,
    },
    PayPal {
        order_id: String,
        capture_id: Option<String>,
        payer_id: Option<String>,
    },
}

impl ProviderReceipt {
    pub fn provider(&self) -> PaymentProvider {
        match self {
            ProviderReceipt::Stripe { .. } => PaymentProvider::Stripe,
            ProviderReceipt::PayPal { .. } => PaymentProvider::PayPal,
        }
    }

    /// Id of the money movement itself (charge or capture), when known.
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            ProviderReceipt::Stripe { charge_id, .. } => charge_id.as_deref(),
            ProviderReceipt::PayPal { capture_id, .. } => capture_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationReceipt {
    pub provider_receipt: ProviderReceipt,
    /// Same value as [`PaymentSession::session_id`].
    pub session_id: String,
    pub status: PaymentStatus,
    /// Amount the provider reports, when it reports one.
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    /// Provider explanation of a decline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ConfirmationReceipt {
    pub fn provider(&self) -> PaymentProvider {
        self.provider_receipt.provider()
    }

    /// Best id for manual reconciliation: the transaction id, else the session.
    pub fn correlation_id(&self) -> &str {
        self.provider_receipt
            .transaction_id()
            .unwrap_or(&self.session_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment provider unreachable: {0}")]
    Network(String),
    #[error("payment provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment provider not configured: {0}")]
    Configuration(String),
    #[error("unexpected payment provider response: {0}")]
    Decode(String),
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Network(_) => true,
            PaymentError::Provider { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PaymentError::Decode(err.to_string())
        } else {
            PaymentError::Network(err.to_string())
        }
    }
}

impl From<PaymentError> for ServiceError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Declined(reason) => ServiceError::PaymentFailed(reason),
            PaymentError::Configuration(msg) => ServiceError::InvalidOperation(msg),
            other => ServiceError::PaymentProvider(other.to_string()),
        }
    }
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    async fn create_payment_session(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentSession, PaymentError>;

    async fn confirm(&self, session: &PaymentSession) -> Result<ConfirmationReceipt, PaymentError>;
}

/// The adapters available to checkout, one per provider.
#[derive(Clone, Default)]
pub struct PaymentRegistry {
    adapters: HashMap<PaymentProvider, Arc<dyn PaymentAdapter>>,
}

impl PaymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every provider whose credentials are configured.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();

        if let Some(stripe) = StripeConfig::from_app_config(config) {
            registry.register(Arc::new(StripeAdapter::new(stripe)));
        }
        if let Some(paypal) = PayPalConfig::from_app_config(config) {
            registry.register(Arc::new(PayPalAdapter::new(paypal)));
        }

        info!(providers = ?registry.providers(), "Payment providers registered");
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn PaymentAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn PaymentAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: PaymentProvider) -> Result<Arc<dyn PaymentAdapter>, PaymentError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| PaymentError::Configuration(format!("{} is not available", provider)))
    }

    pub fn providers(&self) -> Vec<PaymentProvider> {
        let mut providers: Vec<_> = self.adapters.keys().copied().collect();
        providers.sort_by_key(|p| p.to_string());
        providers
    }
}

const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// Decimal places of `currency` in its smallest unit.
pub fn currency_exponent(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
    {
        0
    } else {
        2
    }
}

/// Converts an amount into the provider's smallest currency unit.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, PaymentError> {
    let exponent = currency_exponent(currency);
    let scaled = round_money(amount) * Decimal::from(10_i64.pow(exponent));
    scaled
        .round()
        .to_i64()
        .ok_or_else(|| PaymentError::Decode(format!("amount {} out of range", amount)))
}

pub fn from_minor_units(minor: i64, currency: &str) -> Decimal {
    Decimal::new(minor, currency_exponent(currency))
}

/// Decimal string in the currency's precision, as PayPal expects.
pub fn format_amount(amount: Decimal, currency: &str) -> String {
    let precision = currency_exponent(currency) as usize;
    format!("{:.*}", precision, round_money(amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn minor_units_respect_currency_exponent() {
        assert_eq!(to_minor_units(dec!(63.99), "usd").unwrap(), 6399);
        assert_eq!(to_minor_units(dec!(1500), "JPY").unwrap(), 1500);
        assert_eq!(from_minor_units(6399, "USD"), dec!(63.99));
        assert_eq!(from_minor_units(1500, "jpy"), dec!(1500));
    }

    #[test]
    fn amounts_are_formatted_for_the_currency() {
        assert_eq!(format_amount(dec!(63.9), "USD"), "63.90");
        assert_eq!(format_amount(dec!(1500), "JPY"), "1500");
    }

    #[test]
    fn provider_names_are_lowercase() {
        assert_eq!(PaymentProvider::PayPal.to_string(), "paypal");
        assert_eq!(
            PaymentProvider::from_str("stripe").unwrap(),
            PaymentProvider::Stripe
        );
        assert_eq!(
            serde_json::to_value(PaymentProvider::PayPal).unwrap(),
            serde_json::json!("paypal")
        );
    }

    #[test]
    fn declines_become_payment_failures() {
        let err: ServiceError = PaymentError::Declined("card declined".into()).into();
        assert!(matches!(err, ServiceError::PaymentFailed(_)));

        let err: ServiceError = PaymentError::Network("timeout".into()).into();
        assert!(matches!(err, ServiceError::PaymentProvider(_)));
    }

    #[test]
    fn correlation_prefers_transaction_id() {
        let receipt = ConfirmationReceipt {
            provider_receipt: ProviderReceipt::PayPal {
                order_id: "5O190127TN364715T".into(),
                capture_id: Some("3C679366HH908993F".into()),
                payer_id: None,
            },
            session_id: "5O190127TN364715T".into(),
            status: PaymentStatus::Succeeded,
            amount: Some(dec!(10)),
            currency: Some("USD".into()),
            failure_reason: None,
        };
        assert_eq!(receipt.correlation_id(), "3C679366HH908993F");
        assert_eq!(receipt.provider(), PaymentProvider::PayPal);
    }
}

use super::{
    from_minor_units, to_minor_units, ConfirmationReceipt, PaymentAdapter, PaymentError,
    PaymentProvider, PaymentRequest, PaymentSession, PaymentStatus, ProviderReceipt,
};
use crate::{config::AppConfig, services::constant_time_eq};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use std::{collections::HashMap, time::Duration};
use tracing::{info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub api_base: String,
}

impl StripeConfig {
    pub fn from_app_config(config: &AppConfig) -> Option<Self> {
        let secret_key = config.stripe_secret_key.clone().filter(|k| !k.is_empty())?;
        Some(Self {
            secret_key,
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
        })
    }
}

/// Stripe PaymentIntents adapter
#[derive(Clone)]
pub struct StripeAdapter {
    config: StripeConfig,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub last_payment_error: Option<StripeApiError>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeApiError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeApiError,
}

/// Maps a PaymentIntent status. `requires_payment_method` after a failed
/// attempt is a decline; before any attempt it is still awaiting the payer.
pub fn map_intent_status(status: &str, has_payment_error: bool) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Succeeded,
        "canceled" => PaymentStatus::Cancelled,
        "requires_payment_method" if has_payment_error => PaymentStatus::Declined,
        _ => PaymentStatus::RequiresAction,
    }
}

impl PaymentIntent {
    pub fn receipt(&self) -> ConfirmationReceipt {
        ConfirmationReceipt {
            provider_receipt: ProviderReceipt::Stripe {
                payment_intent_id: self.id.clone(),
                charge_id: self.latest_charge.clone(),
            },
            session_id: self.id.clone(),
            status: map_intent_status(&self.status, self.last_payment_error.is_some()),
            amount: Some(from_minor_units(self.amount, &self.currency)),
            currency: Some(self.currency.to_uppercase()),
            failure_reason: self
                .last_payment_error
                .as_ref()
                .and_then(|e| e.message.clone()),
        }
    }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PaymentError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| PaymentError::Decode(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<StripeErrorEnvelope>(&body)
        .ok()
        .and_then(|envelope| envelope.error.message)
        .unwrap_or(body);

    warn!(status = status.as_u16(), %message, "Stripe API error");
    if status == reqwest::StatusCode::PAYMENT_REQUIRED {
        Err(PaymentError::Declined(message))
    } else {
        Err(PaymentError::Provider {
            status: status.as_u16(),
            message,
        })
    }
}

impl StripeAdapter {
    pub fn new(config: StripeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    pub async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/payment_intents/{}", id)))
            .basic_auth(&self.config.secret_key, Some(""))
            .send()
            .await?;
        parse_response(response).await
    }
}

#[async_trait]
impl PaymentAdapter for StripeAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    #[instrument(skip(self, request), fields(order = %request.order_reference))]
    async fn create_payment_session(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentSession, PaymentError> {
        let amount = to_minor_units(request.amount, &request.currency)?;

        let mut params: Vec<(String, String)> = vec![
            ("amount".into(), amount.to_string()),
            ("currency".into(), request.currency.to_lowercase()),
            ("automatic_payment_methods[enabled]".into(), "true".into()),
            (
                "description".into(),
                format!("{} plugin(s)", request.items.len()),
            ),
            (
                "metadata[order_reference]".into(),
                request.order_reference.to_string(),
            ),
            (
                "metadata[item_count]".into(),
                request.items.len().to_string(),
            ),
        ];
        if let Some(code) = &request.coupon_code {
            params.push(("metadata[coupon_code]".into(), code.clone()));
        }
        if let Some(email) = &request.customer_email {
            params.push(("receipt_email".into(), email.clone()));
        }

        let response = self
            .client
            .post(self.url("/v1/payment_intents"))
            .basic_auth(&self.config.secret_key, Some(""))
            .header("Idempotency-Key", format!("order-{}", request.order_reference))
            .form(&params)
            .send()
            .await?;

        let intent: PaymentIntent = parse_response(response).await?;
        info!(payment_intent = %intent.id, "Stripe PaymentIntent created");

        let mut session = PaymentSession::new(PaymentProvider::Stripe, intent.id);
        session.client_secret = intent.client_secret;
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn confirm(&self, session: &PaymentSession) -> Result<ConfirmationReceipt, PaymentError> {
        let intent = self.retrieve_intent(&session.session_id).await?;
        Ok(intent.receipt())
    }
}

/// Envelope of a Stripe webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// The PaymentIntent carried by `payment_intent.*` events.
    pub fn payment_intent(&self) -> Option<PaymentIntent> {
        if !self.event_type.starts_with("payment_intent.") {
            return None;
        }
        serde_json::from_value(self.data.object.clone()).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WebhookSignatureError {
    #[error("malformed Stripe-Signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    OutsideTolerance,
    #[error("no matching signature")]
    Mismatch,
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// `Stripe-Signature` header value for `payload`, as Stripe would send it.
pub fn sign_webhook_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let signature = compute_signature(secret, timestamp, payload).unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}

/// Verifies a `Stripe-Signature` header (`t=..,v1=..[,v1=..]`) against the
/// raw request body.
pub fn verify_webhook_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), WebhookSignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookSignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(WebhookSignatureError::Malformed);
    }
    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(WebhookSignatureError::OutsideTolerance);
    }

    let expected =
        compute_signature(secret, timestamp, payload).ok_or(WebhookSignatureError::Malformed)?;
    if candidates
        .iter()
        .any(|candidate| constant_time_eq(candidate.as_bytes(), expected.as_bytes()))
    {
        Ok(())
    } else {
        Err(WebhookSignatureError::Mismatch)
    }
}

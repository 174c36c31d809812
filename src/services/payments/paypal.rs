use super::{
    format_amount, ConfirmationReceipt, PaymentAdapter, PaymentError, PaymentProvider,
    PaymentRequest, PaymentSession, PaymentStatus, ProviderReceipt,
};
use crate::config::AppConfig;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use std::{
    str::FromStr,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

impl PayPalConfig {
    pub fn from_app_config(config: &AppConfig) -> Option<Self> {
        let client_id = config.paypal_client_id.clone().filter(|v| !v.is_empty())?;
        let client_secret = config
            .paypal_client_secret
            .clone()
            .filter(|v| !v.is_empty())?;

        Some(Self {
            client_id,
            client_secret,
            api_base: config.paypal_api_base.trim_end_matches('/').to_string(),
            return_url: config.paypal_return_url.clone(),
            cancel_url: config.paypal_cancel_url.clone(),
        })
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// PayPal Orders v2 adapter
pub struct PayPalAdapter {
    config: PayPalConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalOrder {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub links: Vec<PayPalLink>,
    #[serde(default)]
    pub payer: Option<PayPalPayer>,
    #[serde(default)]
    pub purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalLink {
    pub href: String,
    pub rel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalPayer {
    #[serde(default)]
    pub payer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseUnit {
    #[serde(default)]
    pub payments: Option<PurchaseUnitPayments>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseUnitPayments {
    #[serde(default)]
    pub captures: Vec<Capture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Capture {
    pub id: String,
    pub status: String,
    pub amount: Money,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Money {
    pub currency_code: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PayPalErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<PayPalErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct PayPalErrorDetail {
    issue: String,
    #[serde(default)]
    description: Option<String>,
}

enum ApiFailure {
    Issue { issue: String, message: String },
    Other(PaymentError),
}

impl From<reqwest::Error> for ApiFailure {
    fn from(err: reqwest::Error) -> Self {
        ApiFailure::Other(err.into())
    }
}

impl From<ApiFailure> for PaymentError {
    fn from(failure: ApiFailure) -> Self {
        match failure {
            ApiFailure::Issue { issue, message } if is_decline_issue(&issue) => {
                PaymentError::Declined(message)
            }
            ApiFailure::Issue { issue, message } => PaymentError::Provider {
                status: 422,
                message: format!("{}: {}", issue, message),
            },
            ApiFailure::Other(err) => err,
        }
    }
}

fn is_decline_issue(issue: &str) -> bool {
    matches!(
        issue,
        "INSTRUMENT_DECLINED" | "DECLINED" | "TRANSACTION_REFUSED" | "PAYER_CANNOT_PAY"
    )
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiFailure> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ApiFailure::Other(PaymentError::Decode(e.to_string())));
    }

    let body = response.text().await.unwrap_or_default();
    let parsed: PayPalErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = parsed
        .details
        .first()
        .and_then(|d| d.description.clone())
        .or(parsed.message)
        .unwrap_or_else(|| body.clone());

    warn!(status = status.as_u16(), name = ?parsed.name, %message, "PayPal API error");

    match parsed.details.into_iter().next() {
        Some(detail) if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY => {
            Err(ApiFailure::Issue {
                issue: detail.issue,
                message,
            })
        }
        _ => Err(ApiFailure::Other(PaymentError::Provider {
            status: status.as_u16(),
            message,
        })),
    }
}

/// Maps an order (and its first capture, if any) to a payment status.
pub fn map_order_status(order_status: &str, capture_status: Option<&str>) -> PaymentStatus {
    match (order_status, capture_status) {
        (_, Some("DECLINED" | "FAILED")) => PaymentStatus::Declined,
        ("COMPLETED", Some("PENDING")) => PaymentStatus::RequiresAction,
        ("COMPLETED", _) => PaymentStatus::Succeeded,
        ("VOIDED", _) => PaymentStatus::Cancelled,
        _ => PaymentStatus::RequiresAction,
    }
}

impl PayPalOrder {
    pub fn capture(&self) -> Option<&Capture> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next()
    }

    pub fn approval_url(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href.as_str())
    }

    pub fn receipt(&self) -> ConfirmationReceipt {
        let capture = self.capture();
        let status = map_order_status(&self.status, capture.map(|c| c.status.as_str()));

        ConfirmationReceipt {
            provider_receipt: ProviderReceipt::PayPal {
                order_id: self.id.clone(),
                capture_id: capture.map(|c| c.id.clone()),
                payer_id: self.payer.as_ref().and_then(|p| p.payer_id.clone()),
            },
            session_id: self.id.clone(),
            status,
            amount: capture.and_then(|c| Decimal::from_str(&c.amount.value).ok()),
            currency: capture.map(|c| c.amount.currency_code.clone()),
            failure_reason: match status {
                PaymentStatus::Declined => Some("PayPal declined the capture".to_string()),
                _ => None,
            },
        }
    }
}

impl PayPalAdapter {
    pub fn new(config: PayPalConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    /// Client-credentials access token, cached until shortly before expiry.
    async fn access_token(&self) -> Result<String, PaymentError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = parse_response(response).await?;
        debug!(expires_in = token.expires_in, "PayPal access token refreshed");

        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<PayPalOrder, PaymentError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.url(&format!("/v2/checkout/orders/{}", order_id)))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(parse_response(response).await?)
    }

    fn order_body(&self, request: &PaymentRequest) -> serde_json::Value {
        let currency = request.currency.to_uppercase();
        let money = |amount: Decimal| json!({ "currency_code": currency, "value": format_amount(amount, &currency) });

        let items: Vec<_> = request
            .items
            .iter()
            .map(|line| {
                json!({
                    "name": line.title,
                    "sku": line.product_id.to_string(),
                    "quantity": "1",
                    "category": "DIGITAL_GOODS",
                    "unit_amount": money(line.price),
                })
            })
            .collect();

        let mut context = json!({
            "shipping_preference": "NO_SHIPPING",
            "user_action": "PAY_NOW",
        });
        if let Some(url) = &self.config.return_url {
            context["return_url"] = json!(url);
        }
        if let Some(url) = &self.config.cancel_url {
            context["cancel_url"] = json!(url);
        }

        json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_reference.to_string(),
                "custom_id": request.order_reference.to_string(),
                "description": format!("{} plugin(s)", request.items.len()),
                "amount": {
                    "currency_code": currency,
                    "value": format_amount(request.amount, &currency),
                    "breakdown": {
                        "item_total": money(request.subtotal),
                        "discount": money(request.discount),
                    }
                },
                "items": items,
            }],
            "application_context": context,
        })
    }
}

#[async_trait]
impl PaymentAdapter for PayPalAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::PayPal
    }

    #[instrument(skip(self, request), fields(order = %request.order_reference))]
    async fn create_payment_session(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentSession, PaymentError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("order-{}", request.order_reference))
            .json(&self.order_body(request))
            .send()
            .await?;

        let order: PayPalOrder = parse_response(response).await?;
        info!(paypal_order = %order.id, "PayPal order created");

        let mut session = PaymentSession::new(PaymentProvider::PayPal, order.id.clone());
        session.approval_url = order.approval_url().map(str::to_string);
        Ok(session)
    }

    /// Captures the approved order. An order the payer has not approved yet
    /// reports `RequiresAction`; one captured earlier is fetched instead.
    #[instrument(skip(self))]
    async fn confirm(&self, session: &PaymentSession) -> Result<ConfirmationReceipt, PaymentError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(&format!(
                "/v2/checkout/orders/{}/capture",
                session.session_id
            )))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("capture-{}", session.session_id))
            .json(&json!({}))
            .send()
            .await?;

        match parse_response::<PayPalOrder>(response).await {
            Ok(order) => Ok(order.receipt()),
            Err(ApiFailure::Issue { issue, .. }) if issue == "ORDER_ALREADY_CAPTURED" => {
                Ok(self.get_order(&session.session_id).await?.receipt())
            }
            Err(ApiFailure::Issue { issue, .. }) if issue == "ORDER_NOT_APPROVED" => {
                Ok(ConfirmationReceipt {
                    provider_receipt: ProviderReceipt::PayPal {
                        order_id: session.session_id.clone(),
                        capture_id: None,
                        payer_id: None,
                    },
                    session_id: session.session_id.clone(),
                    status: PaymentStatus::RequiresAction,
                    amount: None,
                    currency: None,
                    failure_reason: None,
                })
            }
            Err(failure) => Err(failure.into()),
        }
    }
}

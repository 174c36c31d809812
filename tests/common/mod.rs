#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use dashmap::DashMap;
use plugin_market::{
    auth::{Claims, CART_SESSION_HEADER},
    config::AppConfig,
    db,
    entities::{
        bundle,
        discount::{self, DiscountType},
        plugin,
    },
    events::{self, EventSender},
    handlers::AppServices,
    services::{
        cart_store::InMemoryCartStore,
        payments::{
            ConfirmationReceipt, PaymentAdapter, PaymentError, PaymentProvider, PaymentRegistry,
            PaymentRequest, PaymentSession, PaymentStatus, ProviderReceipt,
        },
        storage::InMemoryObjectStorage,
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Stripe stand-in whose confirmation outcome is set by the test.
pub struct ScriptedPaymentAdapter {
    status: Mutex<PaymentStatus>,
    reported_amount: Mutex<Option<Decimal>>,
    amounts: DashMap<String, Decimal>,
    sessions: AtomicUsize,
    confirmations: AtomicUsize,
}

impl ScriptedPaymentAdapter {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(PaymentStatus::Succeeded),
            reported_amount: Mutex::new(None),
            amounts: DashMap::new(),
            sessions: AtomicUsize::new(0),
            confirmations: AtomicUsize::new(0),
        }
    }

    pub fn respond_with(&self, status: PaymentStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Overrides the captured amount the provider reports.
    pub fn report_amount(&self, amount: Decimal) {
        *self.reported_amount.lock().unwrap() = Some(amount);
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn confirmations(&self) -> usize {
        self.confirmations.load(Ordering::SeqCst)
    }

    pub fn receipt(&self, session_id: &str, status: PaymentStatus) -> ConfirmationReceipt {
        let amount = self
            .reported_amount
            .lock()
            .unwrap()
            .or_else(|| self.amounts.get(session_id).map(|a| *a));
        ConfirmationReceipt {
            provider_receipt: ProviderReceipt::Stripe {
                payment_intent_id: session_id.to_string(),
                charge_id: Some(format!("ch_{}", session_id)),
            },
            session_id: session_id.to_string(),
            status,
            amount,
            currency: Some("usd".to_string()),
            failure_reason: (status == PaymentStatus::Declined)
                .then(|| "Your card was declined.".to_string()),
        }
    }
}

#[async_trait]
impl PaymentAdapter for ScriptedPaymentAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    async fn create_payment_session(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentSession, PaymentError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let session_id = format!("pi_{}", request.order_reference.simple());
        self.amounts.insert(session_id.clone(), request.amount);

        let mut session = PaymentSession::new(PaymentProvider::Stripe, session_id.clone());
        session.client_secret = Some(format!("{}_secret_test", session_id));
        Ok(session)
    }

    async fn confirm(&self, session: &PaymentSession) -> Result<ConfirmationReceipt, PaymentError> {
        self.confirmations.fetch_add(1, Ordering::SeqCst);
        let status = *self.status.lock().unwrap();
        Ok(self.receipt(&session.session_id, status))
    }
}

/// Application harness backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub payments: Arc<ScriptedPaymentAdapter>,
    pub storage: Arc<InMemoryObjectStorage>,
    pub carts: Arc<InMemoryCartStore>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.stripe_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let payments = Arc::new(ScriptedPaymentAdapter::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let carts = Arc::new(InMemoryCartStore::new());

        let services = AppServices::new(
            db_arc.clone(),
            &cfg,
            event_sender.clone(),
            PaymentRegistry::new().with(payments.clone()),
            carts.clone(),
            storage.clone(),
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        };

        Self {
            router: plugin_market::app_router(state.clone()),
            state,
            payments,
            storage,
            carts,
            _event_task: event_task,
        }
    }

    /// Bearer token for `customer_id` signed with the test secret.
    pub fn token_for(&self, customer_id: Uuid) -> String {
        let claims = Claims {
            sub: customer_id.to_string(),
            email: Some("steve@example.com".to_string()),
            name: Some("Steve".to_string()),
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
            iat: Some(Utc::now().timestamp()),
            iss: None,
            aud: None,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// Send a request with optional JSON body and extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a raw body, for endpoints that verify the exact bytes.
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body)).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn request_as(
        &self,
        customer_id: Uuid,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        let auth = format!("Bearer {}", self.token_for(customer_id));
        self.request(method, uri, body, &[("authorization", auth.as_str())])
            .await
    }

    pub async fn request_as_guest(
        &self,
        session: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        self.request(method, uri, body, &[(CART_SESSION_HEADER, session)])
            .await
    }

    pub async fn seed_plugin(&self, title: &str, price: Decimal) -> plugin::Model {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let file_path = format!("plugins/{}.jar", id.simple());
        self.storage
            .put(file_path.clone(), format!("jar bytes of {}", title).into_bytes());

        plugin::ActiveModel {
            id: Set(id),
            title: Set(title.to_string()),
            description: Set(Some(format!("{} for your server", title))),
            price: Set(price),
            category: Set("economy".to_string()),
            thumbnail: Set(None),
            file_path: Set(Some(file_path)),
            download_count: Set(0),
            rating: Set(Decimal::ZERO),
            review_count: Set(0),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed plugin")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        min_amount: Decimal,
        max_uses: Option<i32>,
    ) -> discount::Model {
        let now = Utc::now();
        discount::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            name: Set(format!("{} promotion", code)),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            min_amount: Set(min_amount),
            max_uses: Set(max_uses),
            used_count: Set(0),
            valid_from: Set(now - chrono::Duration::days(1)),
            valid_until: Set(None),
            is_active: Set(true),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon")
    }

    pub async fn seed_bundle(&self, name: &str, plugins: &[&plugin::Model]) -> bundle::Model {
        let ids: Vec<String> = plugins.iter().map(|p| p.id.to_string()).collect();
        bundle::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(None),
            price: Set(plugins.iter().map(|p| p.price).sum()),
            plugin_ids: Set(serde_json::json!(ids)),
            is_active: Set(true),
            is_featured: Set(false),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed bundle")
    }

    /// Adds `products` to the customer's cart and starts a Stripe checkout.
    /// Returns the order id.
    pub async fn start_checkout(&self, customer_id: Uuid, products: &[&plugin::Model]) -> Uuid {
        for product in products {
            let response = self
                .request_as(
                    customer_id,
                    Method::POST,
                    "/api/v1/cart/items",
                    Some(serde_json::json!({ "product_id": product.id })),
                )
                .await;
            assert_eq!(response.status(), 200, "add to cart should succeed");
        }

        let response = self
            .request_as(
                customer_id,
                Method::POST,
                "/api/v1/checkout",
                Some(serde_json::json!({
                    "provider": "stripe",
                    "accepted_terms": true,
                })),
            )
            .await;
        assert_eq!(response.status(), 201, "checkout should start");
        let body = response_json(response).await;
        body["data"]["order_id"]
            .as_str()
            .and_then(|id| Uuid::parse_str(id).ok())
            .expect("order id in checkout response")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub async fn response_bytes(response: Response) -> Vec<u8> {
    body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes")
        .to_vec()
}

/// Reads a serialized decimal, rounded to cents.
pub fn money(value: &Value) -> Decimal {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    raw.parse::<Decimal>()
        .map(|d| d.round_dp(2))
        .unwrap_or_else(|_| panic!("not a decimal: {}", value))
}

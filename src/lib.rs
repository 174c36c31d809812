//! Plugin Market
//!
//! Storefront backend for a Minecraft plugin marketplace: catalog, carts with
//! coupons, Stripe and PayPal checkout, order reconciliation and time-boxed
//! secure downloads.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod services;
pub mod tracing;

use axum::{
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

// Common response wrappers
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn validation_errors(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some("Validation failed".to_string()),
            errors: Some(errors),
            meta: Some(ResponseMeta::capture()),
        }
    }

    /// Attaches a user-facing notice such as "Added to Cart".
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}


/// Routes mounted under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    let catalog = Router::new()
        .route("/products", get(handlers::products::list_products))
        .route("/products/:id", get(handlers::products::get_product))
        .route(
            "/products/:id/reviews",
            get(handlers::products::list_reviews).post(handlers::products::submit_review),
        )
        .route("/bundles", get(handlers::products::list_bundles));

    // Guests are identified by the cart session header, customers by bearer token
    let cart = Router::new()
        .route(
            "/cart",
            get(handlers::carts::get_cart).delete(handlers::carts::clear_cart),
        )
        .route("/cart/items", post(handlers::carts::add_item))
        .route("/cart/items/:product_id", delete(handlers::carts::remove_item))
        .route("/cart/bundles/:id", post(handlers::carts::add_bundle))
        .route(
            "/cart/coupon",
            post(handlers::carts::apply_coupon).delete(handlers::carts::remove_coupon),
        )
        .route("/cart/merge", post(handlers::carts::merge_guest_cart));

    let checkout = Router::new()
        .route("/checkout", post(handlers::checkout::begin_checkout))
        .route(
            "/checkout/:order_id/confirm",
            post(handlers::checkout::confirm_checkout),
        )
        .route(
            "/checkout/:order_id/cancel",
            post(handlers::checkout::cancel_checkout),
        )
        .route(
            "/payments/providers",
            get(handlers::checkout::list_payment_providers),
        )
        // Signature-verified, no bearer auth
        .route(
            "/payments/webhooks/stripe",
            post(handlers::payment_webhooks::stripe_webhook),
        );

    let library = Router::new()
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/downloads", get(handlers::downloads::list_downloads))
        .route(
            "/downloads/:order_id/:product_id/reissue",
            post(handlers::downloads::reissue_download),
        );

    Router::new()
        .merge(catalog)
        .merge(cart)
        .merge(checkout)
        .merge(library)
}

/// The full application router without transport layers.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/secure-download/:credential",
            get(handlers::downloads::secure_download),
        )
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
}

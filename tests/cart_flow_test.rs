//! Cart behaviour for guests and signed-in customers.

mod common;

use axum::http::Method;
use common::{money, response_json, TestApp};
use plugin_market::entities::discount::DiscountType;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn guest_cart_adds_each_plugin_once() {
    let app = TestApp::new().await;
    let product = app.seed_plugin("SilkSpawners", dec!(8.99)).await;
    let session = "guest-session-1";

    let first = app
        .request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id })),
        )
        .await;
    assert_eq!(first.status(), 200);
    let first = response_json(first).await;
    assert_eq!(first["message"], "Added to Cart");
    assert_eq!(first["data"]["item_count"], 1);

    let second = app
        .request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id })),
        )
        .await;
    assert_eq!(second.status(), 200);
    let second = response_json(second).await;
    assert_eq!(second["message"], "Already in Cart");
    assert_eq!(second["data"]["item_count"], 1);
    assert_eq!(money(&second["data"]["subtotal"]), dec!(8.99));
}

#[tokio::test]
async fn cart_requires_a_session_or_sign_in() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v1/cart", None, &[]).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn unknown_or_inactive_products_cannot_be_added() {
    let app = TestApp::new().await;
    let response = app
        .request_as_guest(
            "guest-unknown",
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": Uuid::new_v4() })),
        )
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn removing_items_and_clearing() {
    let app = TestApp::new().await;
    let a = app.seed_plugin("Graves", dec!(2.50)).await;
    let b = app.seed_plugin("Elevators", dec!(3.50)).await;
    let session = "guest-remove";

    for product in [&a, &b] {
        app.request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id })),
        )
        .await;
    }

    let removed = app
        .request_as_guest(
            session,
            Method::DELETE,
            &format!("/api/v1/cart/items/{}", a.id),
            None,
        )
        .await;
    assert_eq!(removed.status(), 200);
    let removed = response_json(removed).await;
    assert_eq!(removed["message"], "Removed from Cart");
    assert_eq!(removed["data"]["item_count"], 1);
    assert_eq!(money(&removed["data"]["total"]), dec!(3.50));

    let missing = app
        .request_as_guest(
            session,
            Method::DELETE,
            &format!("/api/v1/cart/items/{}", a.id),
            None,
        )
        .await;
    assert_eq!(missing.status(), 404);

    let cleared = app
        .request_as_guest(session, Method::DELETE, "/api/v1/cart", None)
        .await;
    assert_eq!(cleared.status(), 204);

    let cart = response_json(
        app.request_as_guest(session, Method::GET, "/api/v1/cart", None)
            .await,
    )
    .await;
    assert_eq!(cart["data"]["item_count"], 0);
}

#[tokio::test]
async fn coupon_below_minimum_is_rejected_with_the_threshold() {
    let app = TestApp::new().await;
    let product = app.seed_plugin("Pets", dec!(20.00)).await;
    app.seed_coupon("SAVE20", DiscountType::Percentage, dec!(20), dec!(50), None)
        .await;
    let session = "guest-coupon";

    app.request_as_guest(
        session,
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": product.id })),
    )
    .await;

    let response = app
        .request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/coupon",
            Some(json!({ "code": "SAVE20" })),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert_eq!(
        body["message"],
        "Minimum order amount of $50.00 required for this coupon"
    );

    let cart = response_json(
        app.request_as_guest(session, Method::GET, "/api/v1/cart", None)
            .await,
    )
    .await;
    assert!(cart["data"]["applied_coupon"].is_null());
}

#[tokio::test]
async fn coupon_discount_follows_the_cart() {
    let app = TestApp::new().await;
    let a = app.seed_plugin("Lands", dec!(40.00)).await;
    let b = app.seed_plugin("Towns", dec!(30.00)).await;
    app.seed_coupon("TENOFF", DiscountType::Fixed, dec!(10), dec!(0), None)
        .await;
    let session = "guest-fixed";

    for product in [&a, &b] {
        app.request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id })),
        )
        .await;
    }

    let applied = response_json(
        app.request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/coupon",
            Some(json!({ "code": "tenoff" })),
        )
        .await,
    )
    .await;
    assert_eq!(applied["message"], "Coupon TENOFF applied: -$10.00");
    assert_eq!(money(&applied["data"]["total"]), dec!(60.00));

    let unknown = app
        .request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/coupon",
            Some(json!({ "code": "NOPE" })),
        )
        .await;
    assert_eq!(unknown.status(), 400);
    assert_eq!(response_json(unknown).await["message"], "Invalid coupon code");

    let removed = response_json(
        app.request_as_guest(session, Method::DELETE, "/api/v1/cart/coupon", None)
            .await,
    )
    .await;
    assert!(removed["data"]["applied_coupon"].is_null());
    assert_eq!(money(&removed["data"]["total"]), dec!(70.00));
}

#[tokio::test]
async fn bundle_adds_missing_plugins_only() {
    let app = TestApp::new().await;
    let a = app.seed_plugin("Economy", dec!(10.00)).await;
    let b = app.seed_plugin("Shops", dec!(12.00)).await;
    let c = app.seed_plugin("Auctions", dec!(14.00)).await;
    let bundle = app.seed_bundle("Server Economy", &[&a, &b, &c]).await;
    let session = "guest-bundle";

    app.request_as_guest(
        session,
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": a.id })),
    )
    .await;

    let response = app
        .request_as_guest(
            session,
            Method::POST,
            &format!("/api/v1/cart/bundles/{}", bundle.id),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["message"], "2 plugin(s) from Server Economy added to cart");
    assert_eq!(body["data"]["item_count"], 3);

    let again = response_json(
        app.request_as_guest(
            session,
            Method::POST,
            &format!("/api/v1/cart/bundles/{}", bundle.id),
            None,
        )
        .await,
    )
    .await;
    assert_eq!(again["message"], "Already in Cart");
    assert_eq!(again["data"]["item_count"], 3);
}

#[tokio::test]
async fn guest_cart_merges_into_customer_cart_on_sign_in() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let shared = app.seed_plugin("Citizens Addon", dec!(6.00)).await;
    let guest_only = app.seed_plugin("Scoreboards", dec!(4.00)).await;
    let session = "guest-merge";

    app.request_as(
        customer,
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": shared.id })),
    )
    .await;
    for product in [&shared, &guest_only] {
        app.request_as_guest(
            session,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id })),
        )
        .await;
    }

    let token = format!("Bearer {}", app.token_for(customer));
    let merged = app
        .request(
            Method::POST,
            "/api/v1/cart/merge",
            None,
            &[
                ("authorization", token.as_str()),
                (plugin_market::auth::CART_SESSION_HEADER, session),
            ],
        )
        .await;
    assert_eq!(merged.status(), 200);
    let merged = response_json(merged).await;
    assert_eq!(merged["message"], "Cart Merged");
    assert_eq!(merged["data"]["item_count"], 2);
    assert_eq!(money(&merged["data"]["subtotal"]), dec!(10.00));

    let guest = response_json(
        app.request_as_guest(session, Method::GET, "/api/v1/cart", None)
            .await,
    )
    .await;
    assert_eq!(guest["data"]["item_count"], 0, "guest cart is consumed");

    let without_session = app
        .request_as(customer, Method::POST, "/api/v1/cart/merge", None)
        .await;
    assert_eq!(without_session.status(), 400);
}

#[tokio::test]
async fn catalogue_is_public() {
    let app = TestApp::new().await;
    let product = app.seed_plugin("Dynmap Styles", dec!(1.99)).await;

    let list = app.request(Method::GET, "/api/v1/products", None, &[]).await;
    assert_eq!(list.status(), 200);
    let list = response_json(list).await;
    assert_eq!(list["data"].as_array().map(Vec::len), Some(1));
    assert!(list["data"][0].get("file_path").is_none());

    let filtered = response_json(
        app.request(Method::GET, "/api/v1/products?category=minigames", None, &[])
            .await,
    )
    .await;
    assert_eq!(filtered["data"].as_array().map(Vec::len), Some(0));

    let detail = app
        .request(
            Method::GET,
            &format!("/api/v1/products/{}", product.id),
            None,
            &[],
        )
        .await;
    assert_eq!(detail.status(), 200);

    let health = app.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(health.status(), 200);
    assert_eq!(response_json(health).await["database"], "up");
}

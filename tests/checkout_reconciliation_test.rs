//! Checkout and order reconciliation through the HTTP surface.
//!
//! Covers:
//! - Repeated confirmations settle an order exactly once
//! - Coupon usage is counted once per order
//! - Declines, later successes and cancellations
//! - Amount mismatches escalate instead of fulfilling
//! - Free orders complete without a provider

mod common;

use assert_matches::assert_matches;
use axum::http::Method;
use common::{money, response_json, TestApp};
use plugin_market::{
    entities::{
        coupon_redemption, discount::DiscountType, order::OrderStatus, plugin_download,
        CouponRedemption, Discount, Order, PluginDownload,
    },
    errors::ServiceError,
    services::payments::PaymentStatus,
};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use uuid::Uuid;

async fn credentials_for(app: &TestApp, order_id: Uuid) -> Vec<plugin_download::Model> {
    PluginDownload::find()
        .filter(plugin_download::Column::OrderId.eq(order_id))
        .all(&*app.state.db)
        .await
        .expect("load credentials")
}

async fn order_status(app: &TestApp, order_id: Uuid) -> OrderStatus {
    Order::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .expect("load order")
        .expect("order exists")
        .status
}

#[tokio::test]
async fn confirming_twice_settles_the_order_once() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let economy = app.seed_plugin("EconomyPlus", dec!(29.99)).await;
    let claims = app.seed_plugin("LandClaims", dec!(34.00)).await;

    let order_id = app.start_checkout(customer, &[&economy, &claims]).await;
    assert_eq!(order_status(&app, order_id).await, OrderStatus::Pending);
    assert!(credentials_for(&app, order_id).await.is_empty());

    let uri = format!("/api/v1/checkout/{}/confirm", order_id);
    let first = app.request_as(customer, Method::POST, &uri, None).await;
    assert_eq!(first.status(), 200);
    let first = response_json(first).await;
    assert_eq!(first["data"]["order"]["status"], "paid");
    assert_eq!(first["data"]["payment_status"], "succeeded");
    assert_eq!(first["data"]["downloads"].as_array().map(Vec::len), Some(2));

    let issued = credentials_for(&app, order_id).await;
    assert_eq!(issued.len(), 2);

    let second = app.request_as(customer, Method::POST, &uri, None).await;
    assert_eq!(second.status(), 200);
    let second = response_json(second).await;
    assert_eq!(second["data"]["order"]["status"], "paid");

    let after = credentials_for(&app, order_id).await;
    assert_eq!(after.len(), 2, "no credential may be issued twice");
    let mut before_tokens: Vec<_> = issued.iter().map(|c| c.secure_token.clone()).collect();
    let mut after_tokens: Vec<_> = after.iter().map(|c| c.secure_token.clone()).collect();
    before_tokens.sort();
    after_tokens.sort();
    assert_eq!(before_tokens, after_tokens);

    let order = Order::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        order.payment_transaction_id.as_deref(),
        Some(format!("ch_{}", order.payment_reference).as_str())
    );
    assert!(order.paid_at.is_some());
}

#[tokio::test]
async fn paid_order_clears_the_cart() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("ChestShop", dec!(12.50)).await;

    let order_id = app.start_checkout(customer, &[&product]).await;

    // Pending orders keep the cart so the payer can retry
    let cart = response_json(app.request_as(customer, Method::GET, "/api/v1/cart", None).await).await;
    assert_eq!(cart["data"]["item_count"], 1);

    let uri = format!("/api/v1/checkout/{}/confirm", order_id);
    assert_eq!(app.request_as(customer, Method::POST, &uri, None).await.status(), 200);

    let cart = response_json(app.request_as(customer, Method::GET, "/api/v1/cart", None).await).await;
    assert_eq!(cart["data"]["item_count"], 0);
    assert!(cart["data"]["applied_coupon"].is_null());
}

#[tokio::test]
async fn coupon_usage_is_counted_once_per_order() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("MegaPack", dec!(63.99)).await;
    app.seed_coupon("SAVE10", DiscountType::Percentage, dec!(10), dec!(0), None)
        .await;

    let add = app
        .request_as(
            customer,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id })),
        )
        .await;
    assert_eq!(add.status(), 200);

    let applied = app
        .request_as(
            customer,
            Method::POST,
            "/api/v1/cart/coupon",
            Some(json!({ "code": "save10" })),
        )
        .await;
    assert_eq!(applied.status(), 200);
    let applied = response_json(applied).await;
    assert_eq!(money(&applied["data"]["discount"]), dec!(6.40));
    assert_eq!(money(&applied["data"]["total"]), dec!(57.59));

    let checkout = app
        .request_as(
            customer,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "provider": "stripe", "accepted_terms": true })),
        )
        .await;
    assert_eq!(checkout.status(), 201);
    let checkout = response_json(checkout).await;
    assert_eq!(money(&checkout["data"]["total"]), dec!(57.59));
    let order_id = Uuid::parse_str(checkout["data"]["order_id"].as_str().unwrap()).unwrap();

    // Starting checkout does not consume the coupon
    let coupon = Discount::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(coupon.used_count, 0);

    let uri = format!("/api/v1/checkout/{}/confirm", order_id);
    for _ in 0..3 {
        assert_eq!(app.request_as(customer, Method::POST, &uri, None).await.status(), 200);
    }

    let coupon = Discount::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(coupon.used_count, 1);
    let redemptions = CouponRedemption::find()
        .filter(coupon_redemption::Column::OrderId.eq(order_id))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(redemptions, 1);
}

#[tokio::test]
async fn paid_orders_past_the_coupon_cap_are_still_honoured() {
    let app = TestApp::new().await;
    let product = app.seed_plugin("Quests", dec!(20.00)).await;
    app.seed_coupon("ONCE", DiscountType::Fixed, dec!(5), dec!(0), Some(1))
        .await;

    // Both customers apply the coupon while it still has a free use
    let mut orders = Vec::new();
    for customer in [Uuid::new_v4(), Uuid::new_v4()] {
        app.request_as(
            customer,
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id })),
        )
        .await;
        let applied = app
            .request_as(
                customer,
                Method::POST,
                "/api/v1/cart/coupon",
                Some(json!({ "code": "ONCE" })),
            )
            .await;
        assert_eq!(applied.status(), 200);
        let checkout = response_json(
            app.request_as(
                customer,
                Method::POST,
                "/api/v1/checkout",
                Some(json!({ "provider": "stripe", "accepted_terms": true })),
            )
            .await,
        )
        .await;
        let order_id = Uuid::parse_str(checkout["data"]["order_id"].as_str().unwrap()).unwrap();
        orders.push((customer, order_id));
    }

    for (customer, order_id) in &orders {
        let uri = format!("/api/v1/checkout/{}/confirm", order_id);
        assert_eq!(app.request_as(*customer, Method::POST, &uri, None).await.status(), 200);
        assert_eq!(order_status(&app, *order_id).await, OrderStatus::Paid);
    }

    let coupon = Discount::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(coupon.used_count, 2);
    assert_eq!(coupon.max_uses, Some(1));
    assert_eq!(CouponRedemption::find().count(&*app.state.db).await.unwrap(), 2);
}

#[tokio::test]
async fn checkout_requires_accepted_terms() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("Warps", dec!(5.00)).await;
    app.request_as(
        customer,
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": product.id })),
    )
    .await;

    let response = app
        .request_as(
            customer,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "provider": "stripe", "accepted_terms": false })),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap_or_default()
        .contains("Terms of Service"));
    assert_eq!(app.payments.sessions_created(), 0);
}

#[tokio::test]
async fn empty_cart_cannot_be_checked_out() {
    let app = TestApp::new().await;
    let response = app
        .request_as(
            Uuid::new_v4(),
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "provider": "stripe", "accepted_terms": true })),
        )
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(app.payments.sessions_created(), 0);
}

#[tokio::test]
async fn decline_then_success_pays_the_order() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("Holograms", dec!(9.99)).await;
    let order_id = app.start_checkout(customer, &[&product]).await;
    let uri = format!("/api/v1/checkout/{}/confirm", order_id);

    app.payments.respond_with(PaymentStatus::Declined);
    let declined = app.request_as(customer, Method::POST, &uri, None).await;
    assert_eq!(declined.status(), 402);
    assert_eq!(order_status(&app, order_id).await, OrderStatus::Failed);
    assert!(credentials_for(&app, order_id).await.is_empty());

    app.payments.respond_with(PaymentStatus::Succeeded);
    let paid = app.request_as(customer, Method::POST, &uri, None).await;
    assert_eq!(paid.status(), 200);
    assert_eq!(order_status(&app, order_id).await, OrderStatus::Paid);
    assert_eq!(credentials_for(&app, order_id).await.len(), 1);
}

#[tokio::test]
async fn requires_action_leaves_the_order_pending() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("Jobs", dec!(15.00)).await;
    let order_id = app.start_checkout(customer, &[&product]).await;

    app.payments.respond_with(PaymentStatus::RequiresAction);
    let uri = format!("/api/v1/checkout/{}/confirm", order_id);
    let response = app.request_as(customer, Method::POST, &uri, None).await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["data"]["payment_status"], "requires_action");
    assert_eq!(order_status(&app, order_id).await, OrderStatus::Pending);
}

#[tokio::test]
async fn amount_mismatch_escalates_without_fulfilling() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("Quests", dec!(63.99)).await;
    let order_id = app.start_checkout(customer, &[&product]).await;

    app.payments.report_amount(dec!(0.50));
    let uri = format!("/api/v1/checkout/{}/confirm", order_id);
    let response = app.request_as(customer, Method::POST, &uri, None).await;
    assert_eq!(response.status(), 500);
    let body = response_json(response).await;
    let message = body["message"].as_str().unwrap_or_default();
    assert!(message.contains("contact support"));
    assert!(message.contains(&order_id.to_string()));

    assert_eq!(order_status(&app, order_id).await, OrderStatus::Pending);
    assert!(credentials_for(&app, order_id).await.is_empty());
}

#[tokio::test]
async fn cancelled_checkout_keeps_the_cart_and_rejects_late_payment() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("Vault", dec!(19.00)).await;
    let order_id = app.start_checkout(customer, &[&product]).await;

    let cancel = app
        .request_as(
            customer,
            Method::POST,
            &format!("/api/v1/checkout/{}/cancel", order_id),
            None,
        )
        .await;
    assert_eq!(cancel.status(), 200);
    assert_eq!(order_status(&app, order_id).await, OrderStatus::Cancelled);

    let cart = response_json(app.request_as(customer, Method::GET, "/api/v1/cart", None).await).await;
    assert_eq!(cart["data"]["item_count"], 1);

    let order = Order::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    let receipt = app
        .payments
        .receipt(&order.payment_reference, PaymentStatus::Succeeded);
    let result = app.state.services.reconciler.reconcile(&receipt).await;
    assert_matches!(
        result,
        Err(ServiceError::ReconciliationFailed { order_id: failed, .. }) if failed == order_id
    );
    assert_eq!(order_status(&app, order_id).await, OrderStatus::Cancelled);
    assert!(credentials_for(&app, order_id).await.is_empty());

    let cancel_again = app
        .request_as(
            customer,
            Method::POST,
            &format!("/api/v1/checkout/{}/cancel", order_id),
            None,
        )
        .await;
    assert_eq!(cancel_again.status(), 400);
}

#[tokio::test]
async fn other_customers_cannot_confirm_an_order() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_plugin("Backpacks", dec!(4.99)).await;
    let order_id = app.start_checkout(owner, &[&product]).await;

    let response = app
        .request_as(
            Uuid::new_v4(),
            Method::POST,
            &format!("/api/v1/checkout/{}/confirm", order_id),
            None,
        )
        .await;
    assert_eq!(response.status(), 404);
    assert_eq!(app.payments.confirmations(), 0);
    assert_eq!(order_status(&app, order_id).await, OrderStatus::Pending);
}

#[tokio::test]
async fn fully_discounted_order_completes_without_a_provider() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("Starter Kit", dec!(7.50)).await;
    app.seed_coupon("FREEBIE", DiscountType::Percentage, dec!(100), dec!(0), Some(10))
        .await;

    app.request_as(
        customer,
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": product.id })),
    )
    .await;
    let applied = app
        .request_as(
            customer,
            Method::POST,
            "/api/v1/cart/coupon",
            Some(json!({ "code": "FREEBIE" })),
        )
        .await;
    assert_eq!(applied.status(), 200);

    let response = app
        .request_as(
            customer,
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "provider": "stripe", "accepted_terms": true })),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "paid");
    assert!(body["data"]["payment"].is_null());
    assert_eq!(money(&body["data"]["total"]), dec!(0));
    assert_eq!(body["data"]["downloads"].as_array().map(Vec::len), Some(1));
    assert_eq!(app.payments.sessions_created(), 0);

    let order_id = Uuid::parse_str(body["data"]["order_id"].as_str().unwrap()).unwrap();
    let order = Order::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_provider, "free");
    assert_eq!(order.payment_reference, format!("free:{}", order_id));

    let coupon = Discount::find().one(&*app.state.db).await.unwrap().unwrap();
    assert_eq!(coupon.used_count, 1);
}

#[tokio::test]
async fn order_history_lists_only_own_orders() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_plugin("Ranks", dec!(3.00)).await;
    let order_id = app.start_checkout(customer, &[&product]).await;
    app.start_checkout(Uuid::new_v4(), &[&product]).await;

    let list = response_json(app.request_as(customer, Method::GET, "/api/v1/orders", None).await).await;
    let orders = list["data"].as_array().expect("order list");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["id"], order_id.to_string());

    let detail = app
        .request_as(customer, Method::GET, &format!("/api/v1/orders/{}", order_id), None)
        .await;
    assert_eq!(detail.status(), 200);

    let unauthenticated = app
        .request(Method::GET, "/api/v1/orders", None, &[])
        .await;
    assert_eq!(unauthenticated.status(), 401);
}

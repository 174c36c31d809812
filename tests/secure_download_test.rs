//! Secure download redemption.
//!
//! Covers:
//! - The HTTP endpoint streams the file with attachment headers
//! - Expired, forged and unpaid credentials all answer 403 alike
//! - Concurrent first redemptions count one download
//! - Reissuing rotates the token

mod common;

use assert_matches::assert_matches;
use axum::http::{header, Method};
use chrono::{Duration, Utc};
use common::{response_bytes, response_json, TestApp};
use plugin_market::{
    entities::{
        download_event, order::OrderStatus, plugin, plugin_download, DownloadEvent, Order,
        Plugin, PluginDownload,
    },
    errors::{RedemptionError, ServiceError},
    services::downloads::ClientInfo,
};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, Set};
use uuid::Uuid;

/// Buys `title` and returns the credential and its product.
async fn purchased_credential(app: &TestApp, title: &str) -> (Uuid, plugin::Model, plugin_download::Model) {
    let customer = Uuid::new_v4();
    let product = app.seed_plugin(title, dec!(14.99)).await;
    let order_id = app.start_checkout(customer, &[&product]).await;
    let confirm = app
        .request_as(
            customer,
            Method::POST,
            &format!("/api/v1/checkout/{}/confirm", order_id),
            None,
        )
        .await;
    assert_eq!(confirm.status(), 200);

    let credential = PluginDownload::find()
        .filter(plugin_download::Column::OrderId.eq(order_id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("credential issued on payment");
    (customer, product, credential)
}

async fn download_count(app: &TestApp, product_id: Uuid) -> i64 {
    Plugin::find_by_id(product_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
        .download_count
}

#[tokio::test]
async fn valid_credential_streams_the_file() {
    let app = TestApp::new().await;
    let (_, product, credential) = purchased_credential(&app, "Essentials").await;

    let response = app
        .request(
            Method::GET,
            &format!("/secure-download/{}", credential.credential()),
            None,
            &[("x-forwarded-for", "203.0.113.9"), ("user-agent", "Minecraft-Launcher/2.1")],
        )
        .await;

    assert_eq!(response.status(), 200);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(
        headers[header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
    let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment; filename=\""));
    assert!(disposition.ends_with(".jar\""));

    let body = response_bytes(response).await;
    assert_eq!(body, b"jar bytes of Essentials".to_vec());

    let stamped = PluginDownload::find_by_id(credential.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(stamped.downloaded_at.is_some());
    assert_eq!(stamped.ip_address.as_deref(), Some("203.0.113.9"));
    assert_eq!(stamped.user_agent.as_deref(), Some("Minecraft-Launcher/2.1"));
    assert_eq!(download_count(&app, product.id).await, 1);
}

#[tokio::test]
async fn repeat_downloads_are_audited_but_counted_once() {
    let app = TestApp::new().await;
    let (_, product, credential) = purchased_credential(&app, "WorldEdit Addons").await;
    let uri = format!("/secure-download/{}", credential.credential());

    for _ in 0..3 {
        let response = app.request(Method::GET, &uri, None, &[]).await;
        assert_eq!(response.status(), 200);
    }

    let first_stamp = PluginDownload::find_by_id(credential.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
        .downloaded_at;
    assert!(first_stamp.is_some());
    assert_eq!(download_count(&app, product.id).await, 1);

    let events = DownloadEvent::find()
        .filter(download_event::Column::DownloadId.eq(credential.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events.iter().filter(|e| e.first_redemption).count(), 1);
}

#[tokio::test]
async fn expired_credential_is_rejected() {
    let app = TestApp::new().await;
    let (_, product, credential) = purchased_credential(&app, "Black Market").await;

    // Issued 25 hours ago with the default 24 hour window
    let mut aged = credential.clone().into_active_model();
    aged.created_at = Set(Utc::now() - Duration::hours(25));
    aged.expires_at = Set(Utc::now() - Duration::hours(1));
    aged.update(&*app.state.db).await.unwrap();

    let response = app
        .request(
            Method::GET,
            &format!("/secure-download/{}", credential.credential()),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), 403);
    let body = response_json(response).await;
    assert_eq!(body["error"], "Invalid or expired download link");
    assert_eq!(download_count(&app, product.id).await, 0);
}

#[tokio::test]
async fn credential_lapses_a_day_after_issue() {
    let app = TestApp::new().await;
    let (_, product, credential) = purchased_credential(&app, "Holograms").await;
    let downloads = app.state.services.downloads.clone();
    let code = credential.credential();
    assert_eq!(credential.expires_at, credential.created_at + Duration::hours(24));

    let late = downloads
        .redeem_at(&code, ClientInfo::default(), credential.created_at + Duration::hours(25))
        .await;
    assert_matches!(late, Err(ServiceError::Redemption(RedemptionError::Expired)));
    assert_eq!(download_count(&app, product.id).await, 0);

    let in_time = downloads
        .redeem_at(&code, ClientInfo::default(), credential.created_at + Duration::hours(23))
        .await
        .expect("redeemable within the window");
    assert!(in_time.first_redemption);
    assert_eq!(download_count(&app, product.id).await, 1);
}

#[tokio::test]
async fn forged_and_malformed_credentials_look_the_same() {
    let app = TestApp::new().await;
    let (_, _, credential) = purchased_credential(&app, "Skyblock Core").await;

    let forged = format!("{}::{}", credential.id, "0".repeat(64));
    let unknown = format!("{}::{}", Uuid::new_v4(), credential.secure_token);
    for attempt in [forged.as_str(), unknown.as_str(), "not-a-credential"] {
        let response = app
            .request(Method::GET, &format!("/secure-download/{}", attempt), None, &[])
            .await;
        assert_eq!(response.status(), 403, "attempt {} should be rejected", attempt);
        let body = response_json(response).await;
        assert_eq!(body["error"], "Invalid or expired download link");
    }

    let untouched = PluginDownload::find_by_id(credential.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(untouched.downloaded_at.is_none());
}

#[tokio::test]
async fn credential_of_an_unpaid_order_is_rejected() {
    let app = TestApp::new().await;
    let (_, _, credential) = purchased_credential(&app, "Anticheat Lite").await;

    let order = Order::find_by_id(credential.order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    let mut refunded = order.into_active_model();
    refunded.status = Set(OrderStatus::Cancelled);
    refunded.update(&*app.state.db).await.unwrap();

    let response = app
        .request(
            Method::GET,
            &format!("/secure-download/{}", credential.credential()),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), 403);
    let body = response_json(response).await;
    assert_eq!(body["error"], "Invalid or expired download link");
}

#[tokio::test]
async fn missing_file_is_reported_generically() {
    let app = TestApp::new().await;
    let (_, product, credential) = purchased_credential(&app, "Ghost Plugin").await;

    let mut moved = product.into_active_model();
    moved.file_path = Set(Some("plugins/removed.jar".to_string()));
    moved.update(&*app.state.db).await.unwrap();

    let response = app
        .request(
            Method::GET,
            &format!("/secure-download/{}", credential.credential()),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), 403);
    let body = response_json(response).await;
    assert_eq!(body["error"], "File not found or access denied");
}

#[tokio::test]
async fn concurrent_first_redemptions_count_once() {
    let app = TestApp::new().await;
    let (_, product, credential) = purchased_credential(&app, "Parallel Mines").await;
    let downloads = app.state.services.downloads.clone();
    let code = credential.credential();

    let (a, b) = tokio::join!(
        downloads.redeem(&code, ClientInfo::default()),
        downloads.redeem(&code, ClientInfo::default()),
    );
    let a = a.expect("first redemption succeeds");
    let b = b.expect("second redemption succeeds");

    assert!(
        a.first_redemption ^ b.first_redemption,
        "exactly one redemption may stamp the first download"
    );
    assert_eq!(download_count(&app, product.id).await, 1);
}

#[tokio::test]
async fn reissue_rotates_the_token() {
    let app = TestApp::new().await;
    let (customer, product, credential) = purchased_credential(&app, "Custom Enchants").await;

    let response = app
        .request_as(
            customer,
            Method::POST,
            &format!(
                "/api/v1/downloads/{}/{}/reissue",
                credential.order_id, product.id
            ),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    let new_credential = body["data"]["credential"].as_str().unwrap().to_string();
    assert_ne!(new_credential, credential.credential());
    assert_eq!(
        body["data"]["download_url"],
        format!("/secure-download/{}", new_credential)
    );

    let old = app
        .request(
            Method::GET,
            &format!("/secure-download/{}", credential.credential()),
            None,
            &[],
        )
        .await;
    assert_eq!(old.status(), 403);

    let new = app
        .request(Method::GET, &format!("/secure-download/{}", new_credential), None, &[])
        .await;
    assert_eq!(new.status(), 200);

    let stranger = app
        .request_as(
            Uuid::new_v4(),
            Method::POST,
            &format!(
                "/api/v1/downloads/{}/{}/reissue",
                credential.order_id, product.id
            ),
            None,
        )
        .await;
    assert_eq!(stranger.status(), 404);
}

#[tokio::test]
async fn library_lists_the_customers_credentials() {
    let app = TestApp::new().await;
    let (customer, product, credential) = purchased_credential(&app, "Auction House").await;

    let response = app
        .request_as(customer, Method::GET, "/api/v1/downloads", None)
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    let items = body["data"].as_array().expect("download list");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], credential.id.to_string());
    assert_eq!(items[0]["product_title"], product.title);
    assert_eq!(items[0]["expired"], false);
    assert!(items[0].get("secure_token").is_none());

    let other = response_json(
        app.request_as(Uuid::new_v4(), Method::GET, "/api/v1/downloads", None)
            .await,
    )
    .await;
    assert_eq!(other["data"].as_array().map(Vec::len), Some(0));
}

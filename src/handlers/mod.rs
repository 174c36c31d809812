pub mod carts;
pub mod checkout;
pub mod common;
pub mod downloads;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod products;

use crate::{
    auth::TokenVerifier,
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        cart::CartService,
        cart_store::CartStore,
        catalog::CatalogService,
        checkout::CheckoutService,
        coupons::CouponService,
        downloads::DownloadService,
        orders::OrderService,
        payments::PaymentRegistry,
        reconciler::OrderReconciler,
        reviews::ReviewService,
        storage::ObjectStorage,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub token_verifier: Arc<TokenVerifier>,
    pub catalog: Arc<CatalogService>,
    pub carts: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<OrderReconciler>,
    pub orders: Arc<OrderService>,
    pub downloads: Arc<DownloadService>,
    pub reviews: Arc<ReviewService>,
    pub payments: Arc<PaymentRegistry>,
}

impl AppServices {
    /// Wires every service from its collaborators.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
        payments: PaymentRegistry,
        cart_store: Arc<dyn CartStore>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        let token_verifier = Arc::new(TokenVerifier::new(
            &config.jwt_secret,
            config.auth_issuer.as_deref(),
            config.auth_audience.as_deref(),
        ));
        let payments = Arc::new(payments);

        let catalog = CatalogService::new(db_pool.clone());
        let coupons = CouponService::new(db_pool.clone());
        let carts = CartService::new(cart_store.clone(), catalog.clone(), coupons.clone());
        let reconciler = OrderReconciler::new(
            db_pool.clone(),
            cart_store,
            event_sender.clone(),
            config.download_ttl(),
        );
        let checkout = CheckoutService::new(
            db_pool.clone(),
            carts.clone(),
            catalog.clone(),
            coupons,
            payments.clone(),
            reconciler.clone(),
            event_sender.clone(),
            config.default_currency.clone(),
        );
        let downloads = DownloadService::new(
            db_pool.clone(),
            storage,
            event_sender.clone(),
            config.download_ttl(),
        );
        let orders = OrderService::new(db_pool.clone(), event_sender.clone());
        let reviews = ReviewService::new(db_pool, catalog.clone(), event_sender);

        Self {
            token_verifier,
            catalog: Arc::new(catalog),
            carts: Arc::new(carts),
            checkout: Arc::new(checkout),
            reconciler: Arc::new(reconciler),
            orders: Arc::new(orders),
            downloads: Arc::new(downloads),
            reviews: Arc::new(reviews),
            payments,
        }
    }
}

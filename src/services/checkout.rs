use crate::{
    auth::AuthenticatedCustomer,
    entities::{
        order::{self, OrderLine, OrderStatus},
        Order,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart::{CartOwner, CartService},
        catalog::CatalogService,
        coupons::{round_money, CouponService},
        downloads::DownloadView,
        payments::{PaymentProvider, PaymentRegistry, PaymentRequest, PaymentSession, PaymentStatus},
        reconciler::{OrderReconciler, ReconcileOutcome},
    },
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{str::FromStr, sync::Arc};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Provider name stored on orders that needed no payment.
pub const FREE_ORDER_PROVIDER: &str = "free";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub provider: PaymentProvider,
    /// Defaults to the email of the signed-in customer.
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 120))]
    pub full_name: Option<String>,
    #[validate(custom = "validate_terms_accepted")]
    #[serde(default)]
    pub accepted_terms: bool,
}

fn validate_terms_accepted(accepted: &bool) -> Result<(), ValidationError> {
    if *accepted {
        Ok(())
    } else {
        let mut err = ValidationError::new("terms_not_accepted");
        err.message = Some("Please agree to the Terms of Service and Refund Policy to continue".into());
        Err(err)
    }
}

/// A started checkout: the pending order plus what the client needs to pay.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub payment: Option<PaymentSession>,
    /// Filled when the order was free and completed immediately.
    pub downloads: Vec<DownloadView>,
}

/// State of an order after a confirmation or cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResult {
    pub order: order::Model,
    pub payment_status: PaymentStatus,
    pub downloads: Vec<DownloadView>,
}

impl From<ReconcileOutcome> for CheckoutResult {
    fn from(outcome: ReconcileOutcome) -> Self {
        let now = Utc::now();
        Self {
            order: outcome.order,
            payment_status: outcome.payment_status,
            downloads: outcome
                .credentials
                .into_iter()
                .map(|c| DownloadView::new(c, None, now))
                .collect(),
        }
    }
}

struct PricedCart {
    lines: Vec<OrderLine>,
    subtotal: Decimal,
    discount: Decimal,
    total: Decimal,
    coupon: Option<(String, String)>,
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    catalog: CatalogService,
    coupons: CouponService,
    payments: Arc<PaymentRegistry>,
    reconciler: OrderReconciler,
    event_sender: Arc<EventSender>,
    currency: String,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        catalog: CatalogService,
        coupons: CouponService,
        payments: Arc<PaymentRegistry>,
        reconciler: OrderReconciler,
        event_sender: Arc<EventSender>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            carts,
            catalog,
            coupons,
            payments,
            reconciler,
            event_sender,
            currency: currency.into(),
        }
    }

    /// Prices the cart from the live catalogue and coupon record.
    async fn price_cart(&self, customer_id: Uuid) -> Result<PricedCart, ServiceError> {
        let cart = self.carts.load(&CartOwner::Customer(customer_id)).await?;
        if cart.is_empty() {
            return Err(ServiceError::ValidationError("Your cart is empty".to_string()));
        }

        self.catalog.require_active(&cart.product_ids()).await?;

        let lines: Vec<OrderLine> = cart
            .items
            .iter()
            .map(|item| OrderLine {
                product_id: item.id,
                title: item.title.clone(),
                price: item.price,
            })
            .collect();
        let subtotal = round_money(lines.iter().map(|l| l.price).sum());

        let (discount, coupon) = match &cart.applied_coupon {
            Some(applied) => {
                let (info, discount) = self
                    .coupons
                    .validate_for(&applied.code, subtotal, Utc::now())
                    .await?;
                (discount, Some((info.code, info.name)))
            }
            None => (Decimal::ZERO, None),
        };

        Ok(PricedCart {
            lines,
            subtotal,
            discount,
            total: (subtotal - discount).max(Decimal::ZERO),
            coupon,
        })
    }

    /// Opens a payment with `request.provider` for the customer's cart and
    /// records the pending order.
    #[instrument(skip(self, customer, request), fields(customer_id = %customer.customer_id, provider = %request.provider))]
    pub async fn begin(
        &self,
        customer: &AuthenticatedCustomer,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        request.validate()?;

        let email = request
            .email
            .clone()
            .or_else(|| customer.email.clone())
            .ok_or_else(|| ServiceError::ValidationError("An email address is required".into()))?;

        let priced = self.price_cart(customer.customer_id).await?;
        let order_id = Uuid::new_v4();

        let (provider_name, payment) = if priced.total.is_zero() {
            (FREE_ORDER_PROVIDER.to_string(), None)
        } else {
            let adapter = self.payments.get(request.provider)?;
            let session = adapter
                .create_payment_session(&PaymentRequest {
                    order_reference: order_id,
                    amount: priced.total,
                    subtotal: priced.subtotal,
                    discount: priced.discount,
                    currency: self.currency.clone(),
                    items: priced.lines.clone(),
                    coupon_code: priced.coupon.as_ref().map(|(code, _)| code.clone()),
                    customer_email: Some(email.clone()),
                })
                .await?;
            (request.provider.to_string(), Some(session))
        };

        let payment_reference = payment
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_else(|| format!("{}:{}", FREE_ORDER_PROVIDER, order_id));

        let customer_info = json!({
            "email": email,
            "full_name": request.full_name.clone().or_else(|| customer.name.clone()),
            "payment_method": provider_name,
            "payment_session_id": payment_reference,
            "applied_coupon": priced.coupon.as_ref().map(|(code, name)| json!({
                "code": code,
                "name": name,
                "discount_amount": priced.discount,
            })),
        });

        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(order_id),
            customer_id: Set(customer.customer_id),
            items: Set(serde_json::to_value(&priced.lines)?),
            subtotal: Set(priced.subtotal),
            discount_amount: Set(priced.discount),
            total_amount: Set(priced.total),
            currency: Set(self.currency.clone()),
            status: Set(OrderStatus::Pending),
            payment_provider: Set(provider_name.clone()),
            payment_reference: Set(payment_reference),
            payment_transaction_id: Set(None),
            coupon_code: Set(priced.coupon.as_ref().map(|(code, _)| code.clone())),
            customer_info: Set(customer_info),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        counter!("checkout.sessions.created", 1, "provider" => provider_name.clone());
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                provider: provider_name,
                total: priced.total,
            })
            .await;
        info!(%order_id, total = %priced.total, "Checkout started");

        let (status, downloads) = if payment.is_none() {
            let result = CheckoutResult::from(self.reconciler.complete_without_payment(order).await?);
            (result.order.status, result.downloads)
        } else {
            (order.status, Vec::new())
        };

        Ok(CheckoutSession {
            order_id,
            status,
            subtotal: priced.subtotal,
            discount: priced.discount,
            total: priced.total,
            currency: self.currency.clone(),
            payment,
            downloads,
        })
    }

    async fn customer_order(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        Order::find_by_id(order_id)
            .filter(order::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Asks the provider for the payment outcome and reconciles it.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<CheckoutResult, ServiceError> {
        let order = self.customer_order(customer_id, order_id).await?;

        match order.status {
            OrderStatus::Paid => return Ok(self.reconciler.ensure_fulfilled(order).await?.into()),
            OrderStatus::Cancelled => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Order {} was cancelled",
                    order_id
                )))
            }
            OrderStatus::Pending | OrderStatus::Failed => {}
        }

        let provider = PaymentProvider::from_str(&order.payment_provider).map_err(|_| {
            ServiceError::InvalidOperation(format!(
                "Order {} cannot be confirmed with provider {}",
                order_id, order.payment_provider
            ))
        })?;
        let adapter = self.payments.get(provider)?;

        let receipt = adapter
            .confirm(&PaymentSession::new(provider, order.payment_reference.clone()))
            .await?;
        Ok(self.reconciler.reconcile(&receipt).await?.into())
    }

    /// The payer gave up on the payment. The cart is kept.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<CheckoutResult, ServiceError> {
        let order = self.customer_order(customer_id, order_id).await?;
        let cancelled = self.reconciler.cancel(order.id).await?.ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "Order {} is {} and can no longer be cancelled",
                order_id, order.status
            ))
        })?;

        Ok(CheckoutResult {
            order: cancelled,
            payment_status: PaymentStatus::Cancelled,
            downloads: Vec::new(),
        })
    }
}

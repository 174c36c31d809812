use crate::{
    entities::{
        order::{self, OrderStatus},
        plugin_download, Order,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart::CartOwner,
        cart_store::CartStore,
        coupons::{round_money, CouponService},
        downloads::DownloadService,
        payments::{ConfirmationReceipt, PaymentStatus},
    },
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What a reconciliation did to the order.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub order: order::Model,
    pub payment_status: PaymentStatus,
    /// False when the order was already paid before this call.
    pub newly_paid: bool,
    #[serde(skip)]
    pub credentials: Vec<plugin_download::Model>,
}

struct Settlement {
    order: order::Model,
    newly_paid: bool,
    coupon_redeemed: bool,
    credentials: Vec<plugin_download::Model>,
    created_credentials: Vec<plugin_download::Model>,
}

/// Turns provider confirmations into durable order state.
#[derive(Clone)]
pub struct OrderReconciler {
    db: Arc<DatabaseConnection>,
    carts: Arc<dyn CartStore>,
    event_sender: Arc<EventSender>,
    download_ttl: Duration,
}

/// Moves an order from one of `from` to `to`. Returns whether this call made
/// the transition.
pub async fn transition<C>(
    conn: &C,
    order_id: Uuid,
    from: &[OrderStatus],
    to: OrderStatus,
    now: DateTime<Utc>,
) -> Result<bool, ServiceError>
where
    C: ConnectionTrait,
{
    let result = Order::update_many()
        .set(order::ActiveModel {
            status: Set(to),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.is_in(from.iter().copied()))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

impl OrderReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: Arc<dyn CartStore>,
        event_sender: Arc<EventSender>,
        download_ttl: Duration,
    ) -> Self {
        Self {
            db,
            carts,
            event_sender,
            download_ttl,
        }
    }

    /// Finds the order a receipt belongs to by provider and session id.
    pub async fn find_order(
        &self,
        receipt: &ConfirmationReceipt,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::PaymentProvider.eq(receipt.provider().to_string()))
            .filter(order::Column::PaymentReference.eq(receipt.session_id.clone()))
            .one(&*self.db)
            .await?)
    }

    /// Applies a provider confirmation to its pending order.
    ///
    /// Safe to call any number of times with the same receipt: a paid order
    /// only re-runs the idempotent coupon and credential steps.
    #[instrument(skip(self, receipt), fields(provider = %receipt.provider(), session = %receipt.session_id, status = %receipt.status))]
    pub async fn reconcile(
        &self,
        receipt: &ConfirmationReceipt,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let order = match self.find_order(receipt).await? {
            Some(order) => order,
            None => {
                if receipt.status == PaymentStatus::Succeeded {
                    error!(
                        provider = %receipt.provider(),
                        transaction_id = %receipt.correlation_id(),
                        "Captured payment does not match any order"
                    );
                    counter!("reconciliation.failures", 1);
                }
                return Err(ServiceError::NotFound(format!(
                    "No order for payment session {}",
                    receipt.session_id
                )));
            }
        };

        match receipt.status {
            PaymentStatus::Succeeded => self.settle(order, receipt).await,
            PaymentStatus::Declined => {
                let reason = receipt
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "The payment was declined".to_string());
                self.mark_failed(&order, &reason).await?;
                Err(ServiceError::PaymentFailed(reason))
            }
            PaymentStatus::Cancelled => {
                let order = self.cancel(order.id).await?.unwrap_or(order);
                Ok(ReconcileOutcome {
                    order,
                    payment_status: PaymentStatus::Cancelled,
                    newly_paid: false,
                    credentials: Vec::new(),
                })
            }
            PaymentStatus::RequiresAction => Ok(ReconcileOutcome {
                order,
                payment_status: PaymentStatus::RequiresAction,
                newly_paid: false,
                credentials: Vec::new(),
            }),
        }
    }

    /// Completes an order whose total is zero without contacting a provider.
    pub async fn complete_without_payment(
        &self,
        order: order::Model,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if order.total_amount > rust_decimal::Decimal::ZERO {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} requires payment",
                order.id
            )));
        }
        let settlement = self.finalize(&order, None, Utc::now()).await?;
        Ok(self.after_settlement(settlement, PaymentStatus::Succeeded).await)
    }

    /// Re-runs the idempotent steps for an order that is already paid.
    pub async fn ensure_fulfilled(
        &self,
        order: order::Model,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if !order.is_paid() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is not paid",
                order.id
            )));
        }
        let settlement = self
            .finalize(&order, order.payment_transaction_id.clone(), Utc::now())
            .await?;
        Ok(self.after_settlement(settlement, PaymentStatus::Succeeded).await)
    }

    /// `pending -> cancelled`. Returns the updated order when this call
    /// cancelled it.
    pub async fn cancel(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        let now = Utc::now();
        if !transition(&*self.db, order_id, &[OrderStatus::Pending], OrderStatus::Cancelled, now)
            .await?
        {
            return Ok(None);
        }

        counter!("orders.cancelled", 1);
        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;
        info!(%order_id, "Order cancelled");
        Ok(Order::find_by_id(order_id).one(&*self.db).await?)
    }

    async fn mark_failed(&self, order: &order::Model, reason: &str) -> Result<(), ServiceError> {
        let failed = transition(
            &*self.db,
            order.id,
            &[OrderStatus::Pending],
            OrderStatus::Failed,
            Utc::now(),
        )
        .await?;

        if failed {
            counter!("orders.failed", 1);
            self.event_sender
                .send_or_log(Event::OrderFailed(order.id))
                .await;
            warn!(order_id = %order.id, %reason, "Payment declined");
        }
        Ok(())
    }

    async fn settle(
        &self,
        order: order::Model,
        receipt: &ConfirmationReceipt,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if let Some(reason) = mismatch(&order, receipt) {
            return Err(self.escalate(&order, receipt, reason).await);
        }

        match self
            .finalize(&order, Some(receipt.correlation_id().to_string()), Utc::now())
            .await
        {
            Ok(settlement) => Ok(self.after_settlement(settlement, receipt.status).await),
            Err(err) => Err(self.escalate(&order, receipt, err.to_string()).await),
        }
    }

    /// Marks the order paid and performs the coupon and credential steps in
    /// one transaction. Every step is guarded so a retry repeats nothing.
    async fn finalize(
        &self,
        order: &order::Model,
        transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, ServiceError> {
        let txn = self.db.begin().await?;

        let paid = Order::update_many()
            .set(order::ActiveModel {
                status: Set(OrderStatus::Paid),
                payment_transaction_id: match transaction_id {
                    Some(id) => Set(Some(id)),
                    None => NotSet,
                },
                paid_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.is_in([OrderStatus::Pending, OrderStatus::Failed]))
            .exec(&txn)
            .await?
            .rows_affected
            == 1;

        let current = Order::find_by_id(order.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))?;
        if !current.is_paid() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is {} and cannot be marked paid",
                current.id, current.status
            )));
        }

        let coupon_redeemed = match &current.coupon_code {
            Some(code) => CouponService::redeem(&txn, current.id, code).await?,
            None => false,
        };

        let issued =
            DownloadService::issue_for_order(&txn, &current, self.download_ttl, now).await?;

        txn.commit().await?;

        let created_credentials = issued
            .iter()
            .filter(|i| i.created)
            .map(|i| i.credential.clone())
            .collect();
        Ok(Settlement {
            order: current,
            newly_paid: paid,
            coupon_redeemed,
            credentials: issued.into_iter().map(|i| i.credential).collect(),
            created_credentials,
        })
    }

    async fn after_settlement(
        &self,
        settlement: Settlement,
        payment_status: PaymentStatus,
    ) -> ReconcileOutcome {
        let order = settlement.order;

        if settlement.newly_paid {
            counter!("orders.paid", 1);
            info!(order_id = %order.id, total = %order.total_amount, "Order paid");
            self.event_sender
                .send_or_log(Event::OrderPaid {
                    order_id: order.id,
                    provider_reference: order.payment_reference.clone(),
                })
                .await;

            if let Err(e) = self
                .carts
                .delete(&CartOwner::Customer(order.customer_id))
                .await
            {
                warn!(order_id = %order.id, error = %e, "Failed to clear cart after payment");
            }
        }

        if settlement.coupon_redeemed {
            if let Some(code) = &order.coupon_code {
                self.event_sender
                    .send_or_log(Event::CouponRedeemed {
                        order_id: order.id,
                        code: code.clone(),
                    })
                    .await;
            }
        }

        for credential in &settlement.created_credentials {
            self.event_sender
                .send_or_log(Event::DownloadCredentialIssued {
                    credential_id: credential.id,
                    order_id: order.id,
                    product_id: credential.plugin_id,
                })
                .await;
        }

        ReconcileOutcome {
            order,
            payment_status,
            newly_paid: settlement.newly_paid,
            credentials: settlement.credentials,
        }
    }

    /// Money was captured but the order could not be finalized. Records
    /// enough to reconcile by hand and returns the user-facing error.
    async fn escalate(
        &self,
        order: &order::Model,
        receipt: &ConfirmationReceipt,
        reason: String,
    ) -> ServiceError {
        counter!("reconciliation.failures", 1);
        error!(
            order_id = %order.id,
            provider = %receipt.provider(),
            session_id = %receipt.session_id,
            transaction_id = %receipt.correlation_id(),
            amount = ?receipt.amount,
            %reason,
            "Captured payment could not be reconciled"
        );

        self.event_sender
            .send_or_log(Event::ReconciliationFailed {
                order_id: order.id,
                provider: receipt.provider().to_string(),
                provider_reference: receipt.correlation_id().to_string(),
                reason,
            })
            .await;

        ServiceError::ReconciliationFailed {
            order_id: order.id,
            provider_reference: receipt.correlation_id().to_string(),
        }
    }
}

/// Why a successful receipt does not match the stored order, if it doesn't.
fn mismatch(order: &order::Model, receipt: &ConfirmationReceipt) -> Option<String> {
    if let Some(amount) = receipt.amount {
        if round_money(amount) != round_money(order.total_amount) {
            return Some(format!(
                "captured amount {} differs from order total {}",
                amount, order.total_amount
            ));
        }
    }
    if let Some(currency) = &receipt.currency {
        if !currency.eq_ignore_ascii_case(&order.currency) {
            return Some(format!(
                "captured currency {} differs from order currency {}",
                currency, order.currency
            ));
        }
    }
    None
}

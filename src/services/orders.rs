use crate::{
    entities::{
        order::{self, OrderStatus},
        Order,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::reconciler::transition,
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Orders swept per pass.
const SWEEP_BATCH_SIZE: u64 = 500;

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// The customer's orders, newest first.
    pub async fn list_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<order::Model>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn get_for_customer(
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

    /// Cancels pending orders created before `cutoff`. Each order moves with
    /// the same conditional update as any other transition, so an order that
    /// got paid meanwhile is left alone. Returns how many were cancelled.
    #[instrument(skip(self))]
    pub async fn expire_stale_pending_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let stale: Vec<Uuid> = Order::find()
            .select_only()
            .column(order::Column::Id)
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .order_by_asc(order::Column::CreatedAt)
            .limit(SWEEP_BATCH_SIZE)
            .into_tuple()
            .all(&*self.db)
            .await?;

        let now = Utc::now();
        let mut expired = 0;
        for order_id in stale {
            if transition(
                &*self.db,
                order_id,
                &[OrderStatus::Pending],
                OrderStatus::Cancelled,
                now,
            )
            .await?
            {
                expired += 1;
                self.event_sender
                    .send_or_log(Event::OrderExpired(order_id))
                    .await;
            }
        }

        if expired > 0 {
            counter!("orders.expired", expired);
            info!(expired, %cutoff, "Stale pending orders cancelled");
        }
        Ok(expired)
    }
}

/// Runs [`OrderService::expire_stale_pending_orders`] every `interval`,
/// cancelling pending orders older than `ttl`.
pub async fn run_pending_order_sweeper(
    orders: OrderService,
    ttl: Duration,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(ttl_minutes = ttl.num_minutes(), "Pending order sweeper started");

    loop {
        ticker.tick().await;
        if let Err(e) = orders.expire_stale_pending_orders(Utc::now() - ttl).await {
            error!(error = %e, "Pending order sweep failed");
        }
    }
}

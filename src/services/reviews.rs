use crate::{
    entities::{
        order::{self, OrderStatus},
        plugin, review, Order, Plugin, Review,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog::CatalogService,
};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitReview {
    #[validate(range(min = 1, max = 5))]
    pub rating: i32,
    #[validate(length(max = 2000))]
    pub review_text: Option<String>,
}

#[derive(Clone)]
pub struct ReviewService {
    db: Arc<DatabaseConnection>,
    catalog: CatalogService,
    event_sender: Arc<EventSender>,
}

impl ReviewService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: CatalogService,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            event_sender,
        }
    }

    pub async fn list_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<review::Model>, ServiceError> {
        Ok(Review::find()
            .filter(review::Column::PluginId.eq(product_id))
            .order_by_desc(review::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// The paid order through which the customer bought `product_id`, if any.
    async fn purchase_order(
        &self,
        customer_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Uuid>, ServiceError> {
        let paid = Order::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .filter(order::Column::Status.eq(OrderStatus::Paid))
            .order_by_asc(order::Column::PaidAt)
            .all(&*self.db)
            .await?;
        Ok(paid
            .into_iter()
            .find(|o| o.contains_product(product_id))
            .map(|o| o.id))
    }

    /// Creates or replaces the customer's review of a product and refreshes
    /// the product's rating.
    #[instrument(skip(self, input), fields(rating = input.rating))]
    pub async fn submit(
        &self,
        customer_id: Uuid,
        product_id: Uuid,
        input: SubmitReview,
    ) -> Result<review::Model, ServiceError> {
        input.validate()?;
        self.catalog.get(product_id).await?;

        let order_id = self.purchase_order(customer_id, product_id).await?;
        let text = input
            .review_text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let now = Utc::now();

        let txn = self.db.begin().await?;
        Review::insert(review::ActiveModel {
            id: Set(Uuid::new_v4()),
            plugin_id: Set(product_id),
            customer_id: Set(customer_id),
            rating: Set(input.rating),
            review_text: Set(text),
            is_verified_purchase: Set(order_id.is_some()),
            order_id: Set(order_id),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .on_conflict(
            OnConflict::columns([review::Column::PluginId, review::Column::CustomerId])
                .update_columns([
                    review::Column::Rating,
                    review::Column::ReviewText,
                    review::Column::IsVerifiedPurchase,
                    review::Column::OrderId,
                    review::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        refresh_rating(&txn, product_id).await?;

        let saved = Review::find()
            .filter(review::Column::PluginId.eq(product_id))
            .filter(review::Column::CustomerId.eq(customer_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError("Review missing after save".into()))?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::ReviewSubmitted {
                product_id,
                rating: saved.rating,
            })
            .await;
        info!(%product_id, verified = saved.is_verified_purchase, "Review saved");
        Ok(saved)
    }
}

/// Average of `ratings` to 2 dp, zero when empty.
pub fn average_rating(ratings: &[i32]) -> Decimal {
    if ratings.is_empty() {
        return Decimal::ZERO;
    }
    let sum: i64 = ratings.iter().map(|r| i64::from(*r)).sum();
    (Decimal::from(sum) / Decimal::from(ratings.len()))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

async fn refresh_rating<C>(conn: &C, product_id: Uuid) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let ratings: Vec<i32> = Review::find()
        .filter(review::Column::PluginId.eq(product_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.rating)
        .collect();

    Plugin::update_many()
        .set(plugin::ActiveModel {
            rating: Set(average_rating(&ratings)),
            review_count: Set(ratings.len() as i32),
            ..Default::default()
        })
        .filter(plugin::Column::Id.eq(product_id))
        .exec(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn average_is_rounded_to_two_places() {
        assert_eq!(average_rating(&[]), Decimal::ZERO);
        assert_eq!(average_rating(&[5, 4, 4]), dec!(4.33));
        assert_eq!(average_rating(&[5, 4]), dec!(4.5));
    }

    #[test]
    fn rating_must_be_between_one_and_five() {
        let review = |rating| SubmitReview {
            rating,
            review_text: None,
        };
        assert!(review(0).validate().is_err());
        assert!(review(6).validate().is_err());
        assert!(review(5).validate().is_ok());
    }
}

use crate::{
    entities::{
        coupon_redemption,
        discount::{self, DiscountType},
        CouponRedemption, Discount,
    },
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Rounds a monetary amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Coupon snapshot taken when the coupon is applied to a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponInfo {
    pub code: String,
    pub name: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub min_amount: Decimal,
}

impl CouponInfo {
    /// Discount of this snapshot for `subtotal`. The validity window and usage
    /// cap were checked when the snapshot was taken; the minimum still applies.
    pub fn discount_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal < self.min_amount {
            return Decimal::ZERO;
        }
        discount_amount(self.discount_type, self.discount_value, subtotal)
    }
}

impl From<&discount::Model> for CouponInfo {
    fn from(model: &discount::Model) -> Self {
        Self {
            code: model.code.clone(),
            name: model.name.clone(),
            discount_type: model.discount_type,
            discount_value: model.discount_value,
            min_amount: model.min_amount,
        }
    }
}

/// The live terms a coupon is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponTerms {
    pub info: CouponInfo,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub max_uses: Option<i32>,
    pub used_count: i32,
}

impl From<&discount::Model> for CouponTerms {
    fn from(model: &discount::Model) -> Self {
        Self {
            info: CouponInfo::from(model),
            valid_from: model.valid_from,
            valid_until: model.valid_until,
            max_uses: model.max_uses,
            used_count: model.used_count,
        }
    }
}

/// Why a coupon does not apply. `Display` is the user-facing notice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CouponRejection {
    #[error("Invalid coupon code")]
    UnknownCode,
    #[error("This coupon is not yet valid")]
    NotYetValid,
    #[error("This coupon has expired")]
    Expired,
    #[error("This coupon has reached its usage limit")]
    UsageLimitReached,
    #[error("Minimum order amount of ${min_amount:.2} required for this coupon")]
    MinimumNotMet { min_amount: Decimal },
}

impl From<CouponRejection> for ServiceError {
    fn from(rejection: CouponRejection) -> Self {
        ServiceError::CouponRejected(rejection.to_string())
    }
}

/// Raw discount for `subtotal`, never more than `subtotal` and never negative.
pub fn discount_amount(kind: DiscountType, value: Decimal, subtotal: Decimal) -> Decimal {
    if subtotal <= Decimal::ZERO || value <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let raw = match kind {
        DiscountType::Percentage => subtotal * value / Decimal::ONE_HUNDRED,
        DiscountType::Fixed => value,
    };

    round_money(raw).min(subtotal)
}

/// Evaluates `terms` for `subtotal` at `now`, returning the discount or the
/// reason it does not apply. Has no side effects.
pub fn evaluate(
    subtotal: Decimal,
    terms: &CouponTerms,
    now: DateTime<Utc>,
) -> Result<Decimal, CouponRejection> {
    if now < terms.valid_from {
        return Err(CouponRejection::NotYetValid);
    }
    if matches!(terms.valid_until, Some(until) if now > until) {
        return Err(CouponRejection::Expired);
    }
    if matches!(terms.max_uses, Some(max) if terms.used_count >= max) {
        return Err(CouponRejection::UsageLimitReached);
    }
    if subtotal < terms.info.min_amount {
        return Err(CouponRejection::MinimumNotMet {
            min_amount: terms.info.min_amount,
        });
    }

    Ok(discount_amount(
        terms.info.discount_type,
        terms.info.discount_value,
        subtotal,
    ))
}

/// Whether `used_count` has gone past the coupon's cap.
pub fn over_cap(used_count: i32, max_uses: Option<i32>) -> bool {
    matches!(max_uses, Some(max) if used_count > max)
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Coupon lookups and usage accounting.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds an active coupon by code (case-insensitive).
    pub async fn find_active(&self, code: &str) -> Result<Option<discount::Model>, ServiceError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Ok(None);
        }

        Ok(Discount::find()
            .filter(discount::Column::Code.eq(code))
            .filter(discount::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?)
    }

    /// Validates `code` against the live record for `subtotal`.
    #[instrument(skip(self))]
    pub async fn validate_for(
        &self,
        code: &str,
        subtotal: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(CouponInfo, Decimal), ServiceError> {
        let record = self
            .find_active(code)
            .await?
            .ok_or(CouponRejection::UnknownCode)?;

        let terms = CouponTerms::from(&record);
        let discount = evaluate(subtotal, &terms, now).map_err(|rejection| {
            debug!(code = %record.code, %rejection, "Coupon rejected");
            rejection
        })?;

        Ok((terms.info, discount))
    }

    /// Records that `order_id` consumed `code` and bumps its usage counter.
    ///
    /// Keyed by order id: a second call for the same order changes nothing and
    /// returns `false`. Run it inside the transaction that marks the order paid.
    /// The payment is already captured here, so a use past `max_uses` is
    /// recorded and reported rather than refused.
    pub async fn redeem<C>(conn: &C, order_id: Uuid, code: &str) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        let code = normalize_code(code);
        let inserted = CouponRedemption::insert(coupon_redemption::ActiveModel {
            order_id: Set(order_id),
            discount_code: Set(code.clone()),
            redeemed_at: Set(Utc::now()),
        })
        .on_conflict(
            OnConflict::column(coupon_redemption::Column::OrderId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

        if inserted == 0 {
            debug!(%order_id, %code, "Coupon usage already recorded for order");
            return Ok(false);
        }

        Discount::update_many()
            .col_expr(
                discount::Column::UsedCount,
                Expr::col(discount::Column::UsedCount).add(1),
            )
            .filter(discount::Column::Code.eq(code.clone()))
            .exec(conn)
            .await?;

        let record = Discount::find()
            .filter(discount::Column::Code.eq(code.clone()))
            .one(conn)
            .await?;
        if let Some(record) = record.filter(|r| over_cap(r.used_count, r.max_uses)) {
            counter!("coupons.oversubscribed", 1);
            warn!(
                %order_id,
                %code,
                used_count = record.used_count,
                max_uses = ?record.max_uses,
                "Coupon usage went past its cap after payment"
            );
        }

        counter!("coupons.redeemed", 1);
        info!(%order_id, %code, "Coupon usage recorded");
        Ok(true)
    }
}
